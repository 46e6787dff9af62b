#[cfg(test)]
#[path = "upload_transport_test.rs"]
mod tests;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::Form;
use reqwest::multipart::Part;
use reqwest::Body;
use reqwest::Method;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use super::SessionClient;
use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::ProgressFn;
use crate::domain::models::SessionError;
use crate::domain::models::UploadError;
use crate::domain::models::UploadReceipt;
use crate::domain::models::UploadRequest;
use crate::domain::models::UploadTarget;
use crate::domain::models::UploadTransport;

const CHUNK_SIZE: usize = 64 * 1024;

pub struct HttpUploadTransport {
    session: Arc<SessionClient>,
    project_upload_path: String,
    general_upload_path: String,
}

impl HttpUploadTransport {
    pub fn new(session: Arc<SessionClient>) -> HttpUploadTransport {
        return HttpUploadTransport::with_paths(
            session,
            &Config::get(ConfigKey::ProjectUploadPath),
            &Config::get(ConfigKey::GeneralUploadPath),
        );
    }

    pub fn with_paths(
        session: Arc<SessionClient>,
        project_upload_path: &str,
        general_upload_path: &str,
    ) -> HttpUploadTransport {
        return HttpUploadTransport {
            session,
            project_upload_path: project_upload_path.to_string(),
            general_upload_path: general_upload_path.to_string(),
        };
    }

    pub fn endpoint(&self, target: &UploadTarget) -> String {
        match target {
            UploadTarget::Project(project_id) => {
                return self.project_upload_path.replace("{project}", project_id);
            }
            UploadTarget::General => {
                return self.general_upload_path.to_string();
            }
        }
    }
}

#[async_trait]
impl UploadTransport for HttpUploadTransport {
    #[allow(clippy::implicit_return)]
    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<UploadReceipt, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Aborted);
        }

        // Held in memory so a replay after a session refresh can resend it.
        let contents = Bytes::from(fs::read(&request.file.path).await?);
        let path = self.endpoint(&request.target);

        tracing::debug!(
            task_id = %request.task_id,
            path = %path,
            size = contents.len(),
            "Uploading file"
        );

        let send = self.session.execute(Method::POST, &path, |req| {
            let form = build_form(&request, contents.clone(), progress.clone())?;
            return Ok(req.multipart(form));
        });

        let res = tokio::select! {
            res = send => res?,
            _ = cancel.cancelled() => {
                tracing::debug!(task_id = %request.task_id, "Upload aborted");
                return Err(UploadError::Aborted);
            }
        };

        let body = res.bytes().await.map_err(SessionError::from)?;
        return Ok(UploadReceipt::from_body(&body));
    }
}

fn build_form(
    request: &UploadRequest,
    contents: Bytes,
    progress: ProgressFn,
) -> Result<Form, SessionError> {
    let total = contents.len() as u64;
    let part = Part::stream_with_length(progress_body(contents, progress), total)
        .file_name(request.file.name.to_string())
        .mime_str(&request.file.mime_type)?;

    let mut form = Form::new()
        .part("file", part)
        .text("filename", request.file.name.to_string())
        .text("mimeType", request.file.mime_type.to_string())
        .text("messageType", request.message_type.to_string());

    for (key, value) in request.metadata.iter() {
        form = form.text(key.to_string(), value.to_string());
    }

    return Ok(form);
}

/// Streams `contents` in fixed chunks, reporting the running byte count each
/// time the HTTP stack pulls the next chunk.
fn progress_body(contents: Bytes, progress: ProgressFn) -> Body {
    let total = contents.len() as u64;
    let chunks = (0..contents.len())
        .step_by(CHUNK_SIZE)
        .map(|start| {
            let end = (start + CHUNK_SIZE).min(contents.len());
            return contents.slice(start..end);
        })
        .collect::<Vec<Bytes>>();

    progress(0, total);
    let mut sent = 0u64;
    let stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
        sent += chunk.len() as u64;
        progress(sent, total);
        return Ok::<Bytes, std::io::Error>(chunk);
    }));

    return Body::wrap_stream(stream);
}
