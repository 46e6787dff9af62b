#[cfg(test)]
#[path = "commands_test.rs"]
mod tests;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;
use reqwest::Method;
use tokio::sync::mpsc;
use yansi::Paint;

use crate::domain::models::Event;
use crate::domain::models::LocalFile;
use crate::domain::models::SessionError;
use crate::domain::models::UploadStatus;
use crate::domain::models::UploadTarget;
use crate::domain::models::UploadTask;
use crate::domain::services::UploadManager;
use crate::infrastructure::http::HttpUploadTransport;
use crate::infrastructure::http::SessionClient;
use crate::infrastructure::http::SessionConfig;

/// Tracks what was last printed per task so progress lines are only written
/// when something worth reporting changed.
#[derive(Default)]
pub struct UploadReporter {
    printed: HashMap<String, (UploadStatus, u8)>,
}

impl UploadReporter {
    /// Lines to print for a snapshot. Progress is reported in steps of ten
    /// percent.
    pub fn lines(&mut self, tasks: &[UploadTask]) -> Vec<String> {
        let mut lines = vec![];

        for task in tasks {
            let step = task.progress / 10 * 10;
            let current = (task.status, step);
            if self.printed.get(&task.id) == Some(&current) {
                continue;
            }
            self.printed.insert(task.id.to_string(), current);

            lines.push(format_task(task));
        }

        return lines;
    }
}

pub fn format_task(task: &UploadTask) -> String {
    let mut line = format!("{} [{}]", task.file.name, task.status);

    match task.status {
        UploadStatus::Uploading => {
            line = format!("{line} {}%", task.progress);
        }
        UploadStatus::Success => {
            if let Some(remote_id) = task.remote_id.as_ref() {
                line = format!("{line} {remote_id}");
            }
            if let Some(duration) = task.duration() {
                line = format!("{line} in {}ms", duration.num_milliseconds());
            }
        }
        UploadStatus::Error => {
            if let Some(error) = task.error.as_ref() {
                line = format!("{line} {error}");
            }
        }
        UploadStatus::Queued | UploadStatus::Canceled => {}
    }

    return line;
}

pub fn summarize(tasks: &[UploadTask]) -> String {
    let count = |status: UploadStatus| {
        return tasks.iter().filter(|task| return task.status == status).count();
    };

    return format!(
        "{} uploaded, {} failed, {} canceled",
        count(UploadStatus::Success),
        count(UploadStatus::Error),
        count(UploadStatus::Canceled)
    );
}

/// Cancels every task that has not settled yet and returns how many were
/// canceled. Tasks that settle while this runs are skipped.
pub fn cancel_pending(manager: &UploadManager) -> usize {
    let mut canceled = 0;
    for task in manager.tasks().iter().filter(|task| return !task.is_terminal()) {
        match manager.cancel(&task.id) {
            Ok(()) => canceled += 1,
            Err(err) => {
                tracing::debug!(task_id = %task.id, error = %err, "Could not cancel upload");
            }
        }
    }

    return canceled;
}

fn print_sign_in(rx: &mut mpsc::UnboundedReceiver<Event>) {
    while let Ok(event) = rx.try_recv() {
        if let Event::SignInRequired { url } = event {
            eprintln!(
                "{}",
                Paint::yellow(format!("Your session has ended. Sign in again at {url}"))
            );
        }
    }
}

pub async fn run_request(method: &str, path: &str, data: Option<String>) -> Result<()> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())?;
    let body = match data {
        Some(data) => Some(serde_json::from_str::<serde_json::Value>(&data)?),
        None => None,
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let client = SessionClient::new(SessionConfig::default(), tx)?;
    let timeout = client.config().request_timeout;

    let res = client
        .execute(method, path, |mut req| {
            if let Some(timeout) = timeout {
                req = req.timeout(timeout);
            }
            if let Some(body) = body.as_ref() {
                req = req.json(body);
            }
            return Ok(req);
        })
        .await;

    print_sign_in(&mut rx);

    let res = match res {
        Ok(res) => res,
        Err(SessionError::Status { status, body }) => {
            bail!(format!("Backend responded with {status}\n{body}"));
        }
        Err(err) => return Err(err.into()),
    };

    let status = res.status();
    let text = res.text().await?;
    let text = match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => serde_json::to_string_pretty(&json)?,
        Err(_) => text,
    };

    eprintln!("{}", Paint::green(status.to_string()));
    println!("{text}");

    return Ok(());
}

pub async fn run_upload(
    project: Option<String>,
    metadata: Vec<(String, String)>,
    paths: Vec<String>,
) -> Result<()> {
    let mut files = vec![];
    for path in paths.iter() {
        files.push(LocalFile::from_path(path).await?);
    }

    let target = match project {
        Some(project) => UploadTarget::Project(project),
        None => UploadTarget::General,
    };
    let metadata = metadata.into_iter().collect::<BTreeMap<String, String>>();

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let session = Arc::new(SessionClient::new(SessionConfig::default(), tx.clone())?);
    let manager = UploadManager::new(Arc::new(HttpUploadTransport::new(session)), tx);

    let batch = manager.upload_files(files, target, metadata)?;
    let mut reporter = UploadReporter::default();
    let settled = batch.settled();
    tokio::pin!(settled);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = &mut settled => break,
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                eprintln!("{}", Paint::yellow("Canceling uploads"));
                let canceled = cancel_pending(&manager);
                tracing::debug!(canceled, "Canceled pending uploads");
            }
            Some(event) = rx.recv() => match event {
                Event::UploadTasks(tasks) => {
                    for line in reporter.lines(&tasks) {
                        println!("{line}");
                    }
                }
                Event::SignInRequired { url } => {
                    eprintln!(
                        "{}",
                        Paint::yellow(format!("Your session has ended. Sign in again at {url}"))
                    );
                }
            },
        }
    }

    let tasks = manager.tasks();
    for line in reporter.lines(&tasks) {
        println!("{line}");
    }
    print_sign_in(&mut rx);
    manager.dispose();

    let summary = summarize(&tasks);
    if tasks.iter().any(|task| return task.status == UploadStatus::Error) {
        bail!(summary);
    }
    println!("{summary}");

    return Ok(());
}
