#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_MEDIS_PORT: u16 = 3000;
pub const DEFAULT_MEDIS_HOST: &str = "127.0.0.1";
pub const DEFAULT_STORAGE_ROOT: &str = "storage";
pub const DEFAULT_WWW_ROOT: &str = "public";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";

const VIDEOS_SUBDIR: &str = "videos";
const THUMBNAILS_SUBDIR: &str = "thumbnails";
const COOKIES_SUBDIR: &str = "cookies";
const COOKIES_FILE: &str = "cookies.txt";
const DATABASE_FILE: &str = "medis.db";

/// Effective runtime settings after merging CLI overrides, the process
/// environment and the `.env` file (in that order of precedence).
#[derive(Debug, Clone)]
pub struct Settings {
    pub storage_root: PathBuf,
    pub www_root: PathBuf,
    pub port: u16,
    pub host: String,
    /// `None` means no admission limit.
    pub max_queue_limit: Option<usize>,
    /// `None` means whole playlists are listed.
    pub playlist_limit: Option<usize>,
    pub cookies_dir: PathBuf,
    pub auto_update_ytdlp: bool,
    pub ytdlp_bin: PathBuf,
}

impl Settings {
    pub fn storage(&self) -> StoragePaths {
        StoragePaths::new(&self.storage_root, &self.cookies_dir)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub storage_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub max_queue_limit: Option<usize>,
    pub playlist_limit: Option<usize>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: RuntimeOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Settings {
    build_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Settings {
    let storage_root = overrides
        .storage_root
        .or_else(|| lookup_value("STORAGE_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT));
    let www_root = overrides
        .www_root
        .or_else(|| lookup_value("WWW_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WWW_ROOT));
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("PORT", file_vars, &env_lookup).and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_MEDIS_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup_value("MEDIS_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_MEDIS_HOST.to_string());
    let max_queue_limit = overrides
        .max_queue_limit
        .filter(|limit| *limit > 0)
        .or_else(|| parse_limit(lookup_value("MAX_QUEUE_LIMIT", file_vars, &env_lookup)));
    let playlist_limit = overrides
        .playlist_limit
        .filter(|limit| *limit > 0)
        .or_else(|| {
            parse_limit(lookup_value(
                "PLAYLIST_DOWNLOAD_LIMIT",
                file_vars,
                &env_lookup,
            ))
        });
    let cookies_dir = lookup_value("COOKIES_DIR", file_vars, &env_lookup)
        .map(PathBuf::from)
        .unwrap_or_else(|| storage_root.join(COOKIES_SUBDIR));
    let auto_update_ytdlp = lookup_value("AUTO_UPDATE_YTDLP", file_vars, &env_lookup)
        .map(|value| parse_flag(&value))
        .unwrap_or(false);
    let ytdlp_bin = lookup_value("YTDLP_BIN", file_vars, &env_lookup)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));

    Settings {
        storage_root,
        www_root,
        port,
        host,
        max_queue_limit,
        playlist_limit,
        cookies_dir,
        auto_update_ytdlp,
        ytdlp_bin,
    }
}

/// Zero, negative and unparsable limits all mean "unlimited".
fn parse_limit(value: Option<String>) -> Option<usize> {
    value
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|limit| *limit > 0)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// On-disk layout below the storage root.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub root: PathBuf,
    pub videos: PathBuf,
    pub thumbnails: PathBuf,
    pub cookies_dir: PathBuf,
    pub database: PathBuf,
}

impl StoragePaths {
    pub fn new(root: &Path, cookies_dir: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            videos: root.join(VIDEOS_SUBDIR),
            thumbnails: root.join(THUMBNAILS_SUBDIR),
            cookies_dir: cookies_dir.to_path_buf(),
            database: root.join(DATABASE_FILE),
        }
    }

    /// Layout with the cookies directory nested under the root.
    pub fn for_root(root: &Path) -> Self {
        Self::new(root, &root.join(COOKIES_SUBDIR))
    }

    pub fn cookies_file(&self) -> PathBuf {
        self.cookies_dir.join(COOKIES_FILE)
    }

    /// Creates every directory the server writes into. Startup must abort when
    /// this fails.
    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.root, &self.videos, &self.thumbnails, &self.cookies_dir] {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> Settings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_settings(&vars, |_| None)
    }

    #[test]
    fn defaults_when_nothing_is_configured() {
        let settings = build_settings(&HashMap::new(), |_| None);
        assert_eq!(settings.port, DEFAULT_MEDIS_PORT);
        assert_eq!(settings.host, DEFAULT_MEDIS_HOST);
        assert_eq!(settings.storage_root, PathBuf::from(DEFAULT_STORAGE_ROOT));
        assert_eq!(settings.cookies_dir, PathBuf::from("storage/cookies"));
        assert_eq!(settings.max_queue_limit, None);
        assert_eq!(settings.playlist_limit, None);
        assert!(!settings.auto_update_ytdlp);
        assert_eq!(settings.ytdlp_bin, PathBuf::from(DEFAULT_YTDLP_BIN));
    }

    #[test]
    fn reads_limits_and_flags() {
        let settings = settings_from(
            "MAX_QUEUE_LIMIT=5\nPLAYLIST_DOWNLOAD_LIMIT=\"10\"\nAUTO_UPDATE_YTDLP=true\n",
        );
        assert_eq!(settings.max_queue_limit, Some(5));
        assert_eq!(settings.playlist_limit, Some(10));
        assert!(settings.auto_update_ytdlp);
    }

    #[test]
    fn zero_or_garbage_limits_mean_unlimited() {
        let settings = settings_from("MAX_QUEUE_LIMIT=0\nPLAYLIST_DOWNLOAD_LIMIT=lots\n");
        assert_eq!(settings.max_queue_limit, None);
        assert_eq!(settings.playlist_limit, None);
    }

    #[test]
    fn invalid_port_defaults() {
        let settings = settings_from("PORT=\"nope\"\n");
        assert_eq!(settings.port, DEFAULT_MEDIS_PORT);
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_config("STORAGE_ROOT=\"/file\"\n").path()).unwrap();
        let settings = build_settings(&vars, |key| {
            if key == "STORAGE_ROOT" {
                Some("/env".to_string())
            } else {
                None
            }
        });
        assert_eq!(settings.storage_root, PathBuf::from("/env"));
        assert_eq!(settings.cookies_dir, PathBuf::from("/env/cookies"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export STORAGE_ROOT="/media"
            WWW_ROOT='/www'
            MEDIS_HOST =  "0.0.0.0"
            PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("STORAGE_ROOT").unwrap(), "/media");
        assert_eq!(vars.get("WWW_ROOT").unwrap(), "/www");
        assert_eq!(vars.get("MEDIS_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("STORAGE_ROOT".to_string(), "/file-storage".to_string());
        vars.insert("MEDIS_HOST".to_string(), "file-host".to_string());
        vars.insert("MAX_QUEUE_LIMIT".to_string(), "3".to_string());

        let settings = build_settings_with_overrides(
            &vars,
            |key| {
                if key == "PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            RuntimeOverrides {
                storage_root: Some(PathBuf::from("/override")),
                port: Some(9000),
                host: Some("   ".into()),
                max_queue_limit: Some(7),
                ..RuntimeOverrides::default()
            },
        );

        assert_eq!(settings.storage_root, PathBuf::from("/override"));
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.host, "file-host");
        assert_eq!(settings.max_queue_limit, Some(7));
    }

    #[test]
    fn storage_prepare_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StoragePaths::for_root(&dir.path().join("storage"));
        paths.prepare().unwrap();
        assert!(paths.videos.is_dir());
        assert!(paths.thumbnails.is_dir());
        assert!(paths.cookies_dir.is_dir());
        assert_eq!(paths.cookies_file(), paths.cookies_dir.join("cookies.txt"));
        assert_eq!(paths.database, dir.path().join("storage/medis.db"));
    }
}
