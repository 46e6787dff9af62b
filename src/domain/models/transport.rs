#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use tokio_util::sync::CancellationToken;

use super::LocalFile;
use super::MessageType;
use super::UploadError;
use super::UploadTarget;
use super::UploadTask;

/// Receives `(sent, total)` byte counts as a transfer makes progress.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

pub type TransportBox = Arc<dyn UploadTransport + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadRequest {
    pub task_id: String,
    pub file: LocalFile,
    pub target: UploadTarget,
    pub message_type: MessageType,
    pub metadata: BTreeMap<String, String>,
}

impl UploadRequest {
    pub fn from_task(task: &UploadTask) -> UploadRequest {
        return UploadRequest {
            task_id: task.id.to_string(),
            file: task.file.clone(),
            target: task.target.clone(),
            message_type: task.message_type,
            metadata: task.metadata.clone(),
        };
    }
}

/// What the backend hands back for an accepted upload. Both fields are
/// optional as some endpoints answer with an empty body.
#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    #[serde(default, alias = "documentId")]
    pub id: Option<String>,
    #[serde(default, rename = "taskId")]
    pub task_id: Option<String>,
}

impl UploadReceipt {
    pub fn from_body(body: &[u8]) -> UploadReceipt {
        if body.is_empty() {
            return UploadReceipt::default();
        }

        return serde_json::from_slice(body).unwrap_or_else(|err| {
            tracing::debug!(error = ?err, "Upload response was not a receipt");
            return UploadReceipt::default();
        });
    }
}

#[async_trait]
pub trait UploadTransport {
    /// Sends one file to the backend. Byte progress is reported through
    /// `progress` as the body is consumed.
    ///
    /// Implementations must stop and return `UploadError::Aborted` once
    /// `cancel` fires. The manager also drops the returned future when that
    /// happens, so any in-flight network call is torn down with it.
    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<UploadReceipt, UploadError>;
}
