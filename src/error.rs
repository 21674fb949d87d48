//! Failure classes of a download request and how they map onto HTTP.

use axum::http::StatusCode;
use thiserror::Error;

use crate::ytdlp::ToolError;

pub const EMPTY_FILE_MESSAGE: &str =
    "Downloaded file is empty. The video might be restricted or unavailable. Try another link.";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Invalid JSON in request")]
    InvalidRequest,
    #[error("URL not provided")]
    MissingUrl,
    /// yt-dlp refused to describe the URL; carries its stderr.
    #[error("{0}")]
    MetadataFailed(String),
    #[error("Invalid video info response")]
    InvalidInfo,
    /// yt-dlp exited non-zero while downloading; carries its stderr/stdout.
    #[error("{0}")]
    DownloadFailed(String),
    #[error("Timed out fetching video info")]
    MetadataTimeout,
    #[error("Download timeout (file too large?)")]
    DownloadTimeout,
    #[error("File was not created")]
    FileMissing,
    #[error(
        "Downloaded file is empty. The video might be restricted or unavailable. Try another link."
    )]
    EmptyFile,
    #[error("Server error: {0}")]
    Internal(String),
}

impl DownloadError {
    pub fn status(&self) -> StatusCode {
        match self {
            DownloadError::MetadataTimeout | DownloadError::DownloadTimeout => {
                StatusCode::GATEWAY_TIMEOUT
            }
            DownloadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Maps a failed metadata run. Timeouts keep their own class; anything
    /// else (spawn or wait failure) is a server-side fault.
    pub(crate) fn from_metadata_run(err: ToolError) -> Self {
        match err {
            ToolError::TimedOut { .. } => DownloadError::MetadataTimeout,
            other => DownloadError::Internal(other.to_string()),
        }
    }

    pub(crate) fn from_download_run(err: ToolError) -> Self {
        match err {
            ToolError::TimedOut { .. } => DownloadError::DownloadTimeout,
            other => DownloadError::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::Internal(err.to_string())
    }
}
