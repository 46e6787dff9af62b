#[cfg(test)]
#[path = "error_test.rs"]
mod tests;

use reqwest::Response;
use thiserror::Error;

use super::UploadStatus;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("session refresh failed: {0}")]
    RefreshFailed(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SessionError {
    /// Consumes a non-successful response into a `Status` error, keeping the
    /// body text for diagnostics.
    pub async fn from_response(res: Response) -> SessionError {
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();

        return SessionError::Status { status, body };
    }

    /// HTTP status the backend answered with, when the failure came from one.
    pub fn status(&self) -> Option<u16> {
        if let SessionError::Status { status, .. } = self {
            return Some(*status);
        }

        return None;
    }

    pub fn is_refresh_failure(&self) -> bool {
        return matches!(self, SessionError::RefreshFailed(_));
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload was aborted")]
    Aborted,

    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("upload manager has been disposed")]
    Disposed,

    #[error("no upload task with id {0}")]
    UnknownTask(String),

    #[error("upload task {id} is {status} and cannot be {action}")]
    InvalidState {
        id: String,
        status: UploadStatus,
        action: &'static str,
    },
}
