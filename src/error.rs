//! Domain error taxonomy shared by the queue, the orchestrator and the HTTP
//! layer.

use axum::http::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MedisError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MedisError {
    /// Bad or disallowed URL, malformed id.
    #[error("{0}")]
    Validation(String),

    /// Admission rejected because the queue is at capacity.
    #[error("{0}")]
    Capacity(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error("{0}")]
    PlaylistFetch(String),

    #[error("Metadata extraction failed: {0}")]
    MetadataExtraction(String),

    #[error("{0}")]
    DownloadExecution(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),
}

impl MedisError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// HTTP status used when the error surfaces synchronously to a caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Capacity(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AccessDenied(_) => StatusCode::FORBIDDEN,
            Self::PlaylistFetch(_)
            | Self::MetadataExtraction(_)
            | Self::DownloadExecution(_)
            | Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message pushed to observers in a `downloadError` event.
    pub fn user_message(&self) -> &'static str {
        friendly_download_message(&self.to_string())
    }
}

/// Ordered list of raw yt-dlp error fragments and the text shown to users.
/// The first matching fragment wins.
const FRIENDLY_MESSAGES: &[(&[&str], &str)] = &[
    (&["unsupported url"], "The provided URL is not supported"),
    (
        &["video unavailable"],
        "This video is unavailable or has been removed",
    ),
    (
        &["permission denied"],
        "Cookie file permission denied. Please restart MEDIS",
    ),
    (
        &["sign in", "403: forbidden"],
        "Download failed: This video may be private or regionally restricted. Using a cookies file might help",
    ),
    (
        &["the downloaded file is empty"],
        "Download failed: The file is empty, possibly due to regional restrictions or protection",
    ),
    (&["404"], "Could not find the video. Please check the URL"),
    (
        &["metadata extraction failed"],
        "Failed to get video info. The URL might be incorrect or private",
    ),
];

pub const UNKNOWN_DOWNLOAD_ERROR: &str =
    "An unknown download error occurred. Please check the server logs for more details";

/// Maps a raw tool error to a sanitized, human readable message. Raw output
/// never reaches observers.
pub fn friendly_download_message(raw: &str) -> &'static str {
    let lowered = raw.to_lowercase();
    FRIENDLY_MESSAGES
        .iter()
        .find(|(needles, _)| needles.iter().any(|needle| lowered.contains(needle)))
        .map(|(_, message)| *message)
        .unwrap_or(UNKNOWN_DOWNLOAD_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            MedisError::validation("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            MedisError::Capacity("full".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            MedisError::AccessDenied("private".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            MedisError::not_found("none").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            MedisError::PlaylistFetch("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn metadata_errors_carry_prefix() {
        let err = MedisError::MetadataExtraction("ERROR: Video unavailable".into());
        assert_eq!(
            err.to_string(),
            "Metadata extraction failed: ERROR: Video unavailable"
        );
    }

    #[test]
    fn unavailable_video_wins_over_metadata_prefix() {
        let err = MedisError::MetadataExtraction("ERROR: [youtube] abc: Video unavailable".into());
        assert_eq!(
            err.user_message(),
            "This video is unavailable or has been removed"
        );
    }

    #[test]
    fn bare_metadata_failure_gets_generic_info_message() {
        let err = MedisError::MetadataExtraction("exit status 1".into());
        assert_eq!(
            err.user_message(),
            "Failed to get video info. The URL might be incorrect or private"
        );
    }

    #[test]
    fn friendly_messages_match_case_insensitively() {
        assert_eq!(
            friendly_download_message("ERROR: Unsupported URL: https://x"),
            "The provided URL is not supported"
        );
        assert_eq!(
            friendly_download_message("HTTP Error 403: Forbidden"),
            "Download failed: This video may be private or regionally restricted. Using a cookies file might help"
        );
        assert_eq!(
            friendly_download_message("Sign in to confirm your age"),
            "Download failed: This video may be private or regionally restricted. Using a cookies file might help"
        );
        assert_eq!(
            friendly_download_message("HTTP Error 404: Not Found"),
            "Could not find the video. Please check the URL"
        );
        assert_eq!(
            friendly_download_message("ERROR: The downloaded file is empty"),
            "Download failed: The file is empty, possibly due to regional restrictions or protection"
        );
        assert_eq!(friendly_download_message("segfault"), UNKNOWN_DOWNLOAD_ERROR);
    }
}
