#[cfg(test)]
#[path = "upload_manager_test.rs"]
mod tests;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;
use std::sync::RwLockWriteGuard;
use std::sync::Weak;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::models::progress_percent;
use crate::domain::models::Event;
use crate::domain::models::LocalFile;
use crate::domain::models::ProgressFn;
use crate::domain::models::TransportBox;
use crate::domain::models::UploadError;
use crate::domain::models::UploadReceipt;
use crate::domain::models::UploadRequest;
use crate::domain::models::UploadStatus;
use crate::domain::models::UploadTarget;
use crate::domain::models::UploadTask;

/// Tasks created by one submission, plus the loop working through them.
pub struct UploadBatch {
    pub tasks: Vec<UploadTask>,
    worker: JoinHandle<()>,
}

impl UploadBatch {
    /// Waits until every task in the batch has settled or been skipped.
    pub async fn settled(self) {
        if let Err(err) = self.worker.await {
            tracing::error!(error = ?err, "Upload batch stopped unexpectedly");
        }
    }
}

struct Inner {
    transport: TransportBox,
    tasks: RwLock<Arc<Vec<UploadTask>>>,
    handles: Mutex<HashMap<String, CancellationToken>>,
    root: CancellationToken,
    disposed: AtomicBool,
    tx: mpsc::UnboundedSender<Event>,
}

/// Tracks uploads from submission to a terminal state. Every change replaces
/// the task list with a new snapshot and publishes it as
/// `Event::UploadTasks`. Dropping the manager disposes it.
pub struct UploadManager {
    inner: Arc<Inner>,
}

impl UploadManager {
    pub fn new(transport: TransportBox, tx: mpsc::UnboundedSender<Event>) -> UploadManager {
        return UploadManager {
            inner: Arc::new(Inner {
                transport,
                tasks: RwLock::new(Arc::new(vec![])),
                handles: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
                disposed: AtomicBool::new(false),
                tx,
            }),
        };
    }

    /// Queues one task per file and starts uploading them one after another
    /// in submission order. Returns as soon as the tasks exist. Must be called
    /// from within a Tokio runtime.
    pub fn upload_files(
        &self,
        files: Vec<LocalFile>,
        target: UploadTarget,
        metadata: BTreeMap<String, String>,
    ) -> Result<UploadBatch, UploadError> {
        if self.is_disposed() {
            return Err(UploadError::Disposed);
        }

        let created = files
            .into_iter()
            .map(|file| return UploadTask::new(file, target.clone(), metadata.clone()))
            .collect::<Vec<UploadTask>>();

        {
            let mut handles = self.inner.lock_handles();
            for task in created.iter() {
                handles.insert(task.id.to_string(), self.inner.root.child_token());
            }
        }

        let appended = self.inner.replace(|tasks| {
            tasks.extend(created.iter().cloned());
            return true;
        });
        if !appended {
            return Err(UploadError::Disposed);
        }

        tracing::debug!(count = created.len(), upload_target = ?target, "Queued uploads");

        let ids = created
            .iter()
            .map(|task| return task.id.to_string())
            .collect::<Vec<String>>();

        return Ok(UploadBatch {
            tasks: created,
            worker: self.inner.spawn_batch(ids),
        });
    }

    /// Cancels a queued or uploading task. Queued tasks become `Canceled`
    /// right away and never reach the transport. Uploading tasks are aborted
    /// and settle as `Canceled`.
    pub fn cancel(&self, id: &str) -> Result<(), UploadError> {
        if self.is_disposed() {
            return Err(UploadError::Disposed);
        }

        let mut status = None;
        self.inner.update(id, |task| {
            status = Some(task.status);
            if task.status != UploadStatus::Queued {
                return false;
            }

            task.status = UploadStatus::Canceled;
            task.completed_at = Some(Utc::now());
            return true;
        });

        match status {
            None => {
                return Err(UploadError::UnknownTask(id.to_string()));
            }
            Some(UploadStatus::Queued) | Some(UploadStatus::Uploading) => {
                if let Some(token) = self.inner.lock_handles().remove(id) {
                    token.cancel();
                }
                tracing::debug!(task_id = id, "Canceled upload");
                return Ok(());
            }
            Some(status) => {
                return Err(UploadError::InvalidState {
                    id: id.to_string(),
                    status,
                    action: "canceled",
                });
            }
        }
    }

    /// Deletes a finished task from the list.
    pub fn remove(&self, id: &str) -> Result<UploadTask, UploadError> {
        if self.is_disposed() {
            return Err(UploadError::Disposed);
        }

        let task = self
            .task(id)
            .ok_or_else(|| return UploadError::UnknownTask(id.to_string()))?;
        if !task.is_terminal() {
            return Err(UploadError::InvalidState {
                id: id.to_string(),
                status: task.status,
                action: "removed",
            });
        }

        self.inner.replace(|tasks| {
            let before = tasks.len();
            tasks.retain(|task| return task.id != id || !task.is_terminal());
            return tasks.len() != before;
        });
        self.inner.lock_handles().remove(id);

        return Ok(task);
    }

    /// Queues an errored or canceled task again as a batch of its own.
    pub fn retry(&self, id: &str) -> Result<UploadBatch, UploadError> {
        if self.is_disposed() {
            return Err(UploadError::Disposed);
        }

        let token = self.inner.root.child_token();
        let mut found = None;
        let requeued = self.inner.update(id, |task| {
            found = Some(task.status);
            if !task.status.can_transition_to(UploadStatus::Queued) {
                return false;
            }

            task.status = UploadStatus::Queued;
            task.progress = 0;
            task.error = None;
            task.remote_id = None;
            task.started_at = None;
            task.completed_at = None;
            return true;
        });

        if !requeued {
            return match found {
                Some(status) => Err(UploadError::InvalidState {
                    id: id.to_string(),
                    status,
                    action: "retried",
                }),
                None => Err(UploadError::UnknownTask(id.to_string())),
            };
        }

        self.inner.lock_handles().insert(id.to_string(), token);
        let task = self
            .task(id)
            .ok_or_else(|| return UploadError::UnknownTask(id.to_string()))?;

        tracing::debug!(task_id = id, "Retrying upload");

        return Ok(UploadBatch {
            tasks: vec![task],
            worker: self.inner.spawn_batch(vec![id.to_string()]),
        });
    }

    /// Drops every successful task from the list, returning how many went.
    pub fn clear_finished(&self) -> usize {
        let mut removed = 0;
        self.inner.replace(|tasks| {
            let before = tasks.len();
            tasks.retain(|task| return task.status != UploadStatus::Success);
            removed = before - tasks.len();
            return removed > 0;
        });

        return removed;
    }

    pub fn tasks(&self) -> Arc<Vec<UploadTask>> {
        return self.inner.snapshot();
    }

    pub fn task(&self, id: &str) -> Option<UploadTask> {
        return self
            .inner
            .snapshot()
            .iter()
            .find(|task| return task.id == id)
            .cloned();
    }

    /// Aborts every outstanding transfer and stops applying updates. Calling
    /// it more than once is harmless.
    pub fn dispose(&self) {
        {
            // Flipped under the write lock so no update lands after it.
            let _tasks = self.inner.write_tasks();
            if self.inner.disposed.swap(true, Ordering::SeqCst) {
                return;
            }
        }

        self.inner.root.cancel();
        let aborted = {
            let mut handles = self.inner.lock_handles();
            let count = handles.len();
            handles.clear();
            count
        };

        tracing::debug!(aborted, "Disposed upload manager");
    }

    pub fn is_disposed(&self) -> bool {
        return self.inner.is_disposed();
    }
}

impl Drop for UploadManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    fn is_disposed(&self) -> bool {
        return self.disposed.load(Ordering::SeqCst);
    }

    fn snapshot(&self) -> Arc<Vec<UploadTask>> {
        return self
            .tasks
            .read()
            .map(|tasks| return tasks.clone())
            .unwrap_or_else(|poisoned| return poisoned.into_inner().clone());
    }

    fn write_tasks(&self) -> RwLockWriteGuard<'_, Arc<Vec<UploadTask>>> {
        return self
            .tasks
            .write()
            .unwrap_or_else(|poisoned| return poisoned.into_inner());
    }

    fn lock_handles(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        return self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| return poisoned.into_inner());
    }

    /// Builds the next task list from a copy of the current one. Nothing is
    /// stored or published unless `change` reports a change, or once the
    /// manager is disposed.
    fn replace<F>(&self, change: F) -> bool
    where
        F: FnOnce(&mut Vec<UploadTask>) -> bool,
    {
        let mut tasks = self.write_tasks();
        if self.is_disposed() {
            return false;
        }

        let mut next = tasks.as_ref().clone();
        if !change(&mut next) {
            return false;
        }

        let snapshot = Arc::new(next);
        *tasks = snapshot.clone();

        // Sent under the lock so listeners see snapshots in order.
        if self.tx.send(Event::UploadTasks(snapshot)).is_err() {
            tracing::trace!("No listener for upload task updates");
        }

        return true;
    }

    fn update<F>(&self, id: &str, change: F) -> bool
    where
        F: FnOnce(&mut UploadTask) -> bool,
    {
        return self.replace(|tasks| {
            let Some(task) = tasks.iter_mut().find(|task| return task.id == id) else {
                return false;
            };

            return change(task);
        });
    }

    fn token(&self, id: &str) -> Option<CancellationToken> {
        return self.lock_handles().get(id).cloned();
    }

    fn spawn_batch(self: &Arc<Inner>, ids: Vec<String>) -> JoinHandle<()> {
        let inner = self.clone();

        return tokio::spawn(async move {
            for id in ids {
                if inner.is_disposed() {
                    break;
                }
                Inner::run_task(&inner, &id).await;
            }
        });
    }

    async fn run_task(inner: &Arc<Inner>, id: &str) {
        let Some(token) = inner.token(id) else {
            tracing::debug!(task_id = id, "Skipping upload that was canceled or removed");
            return;
        };
        if token.is_cancelled() {
            return;
        }

        let mut request = None;
        inner.update(id, |task| {
            if task.status != UploadStatus::Queued {
                return false;
            }

            task.status = UploadStatus::Uploading;
            task.progress = 0;
            task.started_at = Some(Utc::now());
            request = Some(UploadRequest::from_task(task));
            return true;
        });
        let Some(request) = request else {
            return;
        };

        tracing::debug!(task_id = id, file = %request.file.name, "Starting upload");

        let progress = progress_reporter(Arc::downgrade(inner), id);
        let res = tokio::select! {
            res = inner.transport.upload(request, progress, token.clone()) => res,
            _ = token.cancelled() => Err(UploadError::Aborted),
        };

        // Released before settling so a retry can register a fresh handle.
        inner.lock_handles().remove(id);
        inner.settle(id, res, token.is_cancelled());
    }

    fn settle(&self, id: &str, res: Result<UploadReceipt, UploadError>, canceled: bool) {
        let settled = self.update(id, |task| {
            if task.status != UploadStatus::Uploading {
                return false;
            }

            match &res {
                Ok(receipt) => {
                    task.status = UploadStatus::Success;
                    task.progress = 100;
                    task.remote_id = receipt.id.clone();
                }
                Err(UploadError::Aborted) => {
                    task.status = UploadStatus::Canceled;
                }
                Err(_) if canceled => {
                    task.status = UploadStatus::Canceled;
                }
                Err(err) => {
                    task.status = UploadStatus::Error;
                    task.error = Some(err.to_string());
                }
            }
            task.completed_at = Some(Utc::now());
            return true;
        });

        if !settled {
            return;
        }

        match res {
            Ok(_) => {
                tracing::debug!(task_id = id, "Upload succeeded");
            }
            Err(UploadError::Aborted) => {
                tracing::debug!(task_id = id, "Upload canceled");
            }
            Err(err) => {
                tracing::warn!(task_id = id, error = %err, "Upload failed");
            }
        };
    }
}

/// Turns byte counts into percentages on the task. Ticks that would move
/// progress backwards, such as a transfer replayed after a session refresh,
/// are dropped.
fn progress_reporter(inner: Weak<Inner>, id: &str) -> ProgressFn {
    let id = id.to_string();

    return Arc::new(move |sent, total| {
        let Some(inner) = inner.upgrade() else {
            return;
        };

        let percent = progress_percent(sent, total);
        inner.update(&id, |task| {
            if task.status != UploadStatus::Uploading || percent <= task.progress {
                return false;
            }

            task.progress = percent;
            return true;
        });
    });
}
