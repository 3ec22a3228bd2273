#![forbid(unsafe_code)]

//! Input checks applied before anything reaches yt-dlp or the filesystem.

use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::{Result, bail};
use nix::unistd::Uid;
use url::{Host, Url};
use uuid::Uuid;

/// Fails fast when the server is started as root. yt-dlp executes arbitrary
/// extractor code, so it should never run with elevated privileges.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Accepts only absolute http(s) URLs whose host is not local or private.
pub fn is_valid_url(raw: &str) -> bool {
    let Ok(parsed) = Url::parse(raw.trim()) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    match parsed.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain != "localhost" && !domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(addr)) => is_public_ipv4(addr),
        Some(Host::Ipv6(addr)) => is_public_ipv6(addr),
        None => false,
    }
}

fn is_public_ipv4(addr: Ipv4Addr) -> bool {
    !(addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        || addr.is_unspecified()
        || addr.is_broadcast())
}

fn is_public_ipv6(addr: Ipv6Addr) -> bool {
    if let Some(mapped) = addr.to_ipv4_mapped() {
        return is_public_ipv4(mapped);
    }
    let segments = addr.segments();
    let unique_local = (segments[0] & 0xfe00) == 0xfc00;
    let link_local = (segments[0] & 0xffc0) == 0xfe80;
    !(addr.is_loopback() || addr.is_unspecified() || unique_local || link_local)
}

/// Playlist URLs carry a `list` query parameter or a playlist path segment.
pub fn is_playlist_url(raw: &str) -> bool {
    let Ok(parsed) = Url::parse(raw.trim()) else {
        return false;
    };
    if parsed.query_pairs().any(|(key, _)| key == "list") {
        return true;
    }
    parsed
        .path_segments()
        .map(|mut segments| segments.any(|segment| segment == "playlist" || segment == "playlists"))
        .unwrap_or(false)
}

/// Canonical hyphenated UUID check used for every `:id` route parameter.
pub fn is_uuid(value: &str) -> bool {
    value.len() == 36 && Uuid::try_parse(value).is_ok()
}
