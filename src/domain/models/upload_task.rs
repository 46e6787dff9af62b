#[cfg(test)]
#[path = "upload_task_test.rs"]
mod tests;

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use tokio::fs;
use uuid::Uuid;

use super::UploadError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UploadStatus {
    Queued,
    Uploading,
    Success,
    Error,
    Canceled,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        return matches!(
            self,
            UploadStatus::Success | UploadStatus::Error | UploadStatus::Canceled
        );
    }

    /// Whether a task may move from this status to `next`. Errored and
    /// canceled tasks may be queued again to retry them.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        return matches!(
            (self, next),
            (UploadStatus::Queued, UploadStatus::Uploading)
                | (UploadStatus::Queued, UploadStatus::Canceled)
                | (UploadStatus::Uploading, UploadStatus::Success)
                | (UploadStatus::Uploading, UploadStatus::Error)
                | (UploadStatus::Uploading, UploadStatus::Canceled)
                | (UploadStatus::Error, UploadStatus::Queued)
                | (UploadStatus::Canceled, UploadStatus::Queued)
        );
    }
}

/// Classification the backend uses to route processing of an uploaded file.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum MessageType {
    Document,
    Image,
    Video,
    Audio,
}

impl MessageType {
    pub fn from_mime(mime_type: &str) -> MessageType {
        let top_level = mime_type
            .split('/')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();

        return match top_level.as_str() {
            "image" => MessageType::Image,
            "video" => MessageType::Video,
            "audio" => MessageType::Audio,
            _ => MessageType::Document,
        };
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadTarget {
    Project(String),
    General,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

impl LocalFile {
    pub fn new(path: PathBuf, name: &str, size: u64, mime_type: &str) -> LocalFile {
        return LocalFile {
            path,
            name: name.to_string(),
            size,
            mime_type: mime_type.to_string(),
        };
    }

    /// Stats a file on disk and guesses its MIME type from the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<LocalFile, UploadError> {
        let path = path.as_ref();
        let metadata = fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(UploadError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a file", path.display()),
            )));
        }

        let name = path
            .file_name()
            .map(|name| return name.to_string_lossy().to_string())
            .unwrap_or_else(|| return path.display().to_string());
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();

        return Ok(LocalFile::new(
            path.to_path_buf(),
            &name,
            metadata.len(),
            &mime_type,
        ));
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTask {
    pub id: String,
    pub file: LocalFile,
    pub target: UploadTarget,
    pub metadata: BTreeMap<String, String>,
    pub status: UploadStatus,
    pub progress: u8,
    pub message_type: MessageType,
    pub error: Option<String>,
    pub remote_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadTask {
    pub fn new(
        file: LocalFile,
        target: UploadTarget,
        metadata: BTreeMap<String, String>,
    ) -> UploadTask {
        let message_type = MessageType::from_mime(&file.mime_type);

        return UploadTask {
            id: Uuid::new_v4().to_string(),
            file,
            target,
            metadata,
            status: UploadStatus::Queued,
            progress: 0,
            message_type,
            error: None,
            remote_id: None,
            started_at: None,
            completed_at: None,
        };
    }

    pub fn is_terminal(&self) -> bool {
        return self.status.is_terminal();
    }

    /// Wall time between the transfer starting and settling. Tasks canceled
    /// before they started have no duration.
    pub fn duration(&self) -> Option<Duration> {
        let started_at = self.started_at?;
        let completed_at = self.completed_at?;

        return Some(completed_at - started_at);
    }
}

/// Converts transferred bytes into a whole percentage. Empty files count as
/// fully sent.
pub fn progress_percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }

    let percent = sent.min(total).saturating_mul(100) / total;
    return percent as u8;
}
