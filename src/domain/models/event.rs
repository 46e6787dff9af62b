use std::sync::Arc;

use super::UploadTask;

#[derive(Clone, Debug)]
pub enum Event {
    /// The session could not be refreshed. Consumers must drop any client
    /// state and send the user to `url` to sign in again.
    SignInRequired { url: String },
    /// Full snapshot of the upload list after a change. Snapshots are never
    /// mutated once published.
    UploadTasks(Arc<Vec<UploadTask>>),
}
