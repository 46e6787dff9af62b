#[cfg(test)]
#[path = "session_client_test.rs"]
mod tests;

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use reqwest::Method;
use reqwest::RequestBuilder;
use reqwest::Response;
use reqwest::StatusCode;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::Deserialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::Event;
use crate::domain::models::SessionError;

pub const CSRF_HEADER: &str = "X-CSRF-Token";

#[derive(Clone, Debug, PartialEq, Eq)]
enum RefreshOutcome {
    Refreshed,
    Failed(String),
    // The refreshing request was dropped before an answer came back.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct CsrfTokenResponse {
    token: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub base_url: String,
    pub csrf_path: String,
    pub refresh_path: String,
    pub sign_in_url: String,
    pub request_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        return SessionConfig {
            base_url: Config::get(ConfigKey::BaseURL),
            csrf_path: Config::get(ConfigKey::CsrfPath),
            refresh_path: Config::get(ConfigKey::RefreshPath),
            sign_in_url: Config::get(ConfigKey::SignInURL),
            request_timeout: Config::request_timeout(),
        };
    }
}

#[derive(Default)]
struct SessionState {
    is_refreshing: bool,
    signed_out: bool,
    // Bumped after every successful refresh.
    epoch: u64,
    pending: Vec<oneshot::Sender<RefreshOutcome>>,
}

enum Recovery {
    Replay,
    Wait(oneshot::Receiver<RefreshOutcome>),
    Lead,
    SignedOut,
}

/// Releases everyone waiting on a refresh exactly once, in the order they
/// queued. If the refreshing future is dropped before settling, waiters are
/// told the refresh was abandoned and one of them takes it over.
struct RefreshGuard<'a> {
    client: &'a SessionClient,
    settled: bool,
}

impl RefreshGuard<'_> {
    fn settle(&mut self, outcome: RefreshOutcome) {
        self.settled = true;

        let pending = {
            let mut state = self.client.lock_state();
            state.is_refreshing = false;
            match outcome {
                RefreshOutcome::Refreshed => state.epoch += 1,
                RefreshOutcome::Failed(_) => state.signed_out = true,
                RefreshOutcome::Abandoned => {}
            }
            std::mem::take(&mut state.pending)
        };

        tracing::debug!(
            waiters = pending.len(),
            outcome = ?outcome,
            "Releasing requests queued behind session refresh"
        );
        for waiter in pending {
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            // Not a sign-out: the refresh never got an answer.
            self.settle(RefreshOutcome::Abandoned);
        }
    }
}

pub struct SessionClient {
    http: reqwest::Client,
    config: SessionConfig,
    csrf_token: tokio::sync::Mutex<Option<String>>,
    state: Mutex<SessionState>,
    tx: mpsc::UnboundedSender<Event>,
}

impl SessionClient {
    pub fn new(
        config: SessionConfig,
        tx: mpsc::UnboundedSender<Event>,
    ) -> Result<SessionClient, SessionError> {
        Url::parse(&config.base_url)
            .map_err(|err| return SessionError::InvalidUrl(format!("{}: {err}", config.base_url)))?;

        // The session credential itself travels as a cookie and is never read
        // here.
        let http = reqwest::Client::builder().cookie_store(true).build()?;

        return Ok(SessionClient {
            http,
            config,
            csrf_token: tokio::sync::Mutex::new(None),
            state: Mutex::new(SessionState::default()),
            tx,
        });
    }

    pub fn config(&self) -> &SessionConfig {
        return &self.config;
    }

    pub async fn get(&self, path: &str) -> Result<Response, SessionError> {
        return self
            .execute(Method::GET, path, |req| return Ok(self.with_timeout(req)))
            .await;
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SessionError> {
        let res = self.get(path).await?;
        let body = res.bytes().await?;

        return Ok(serde_json::from_slice(&body)?);
    }

    pub async fn post_json<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, SessionError> {
        return self.send_json(Method::POST, path, body).await;
    }

    pub async fn put_json<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, SessionError> {
        return self.send_json(Method::PUT, path, body).await;
    }

    pub async fn patch_json<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, SessionError> {
        return self.send_json(Method::PATCH, path, body).await;
    }

    pub async fn delete(&self, path: &str) -> Result<Response, SessionError> {
        return self
            .execute(Method::DELETE, path, |req| return Ok(self.with_timeout(req)))
            .await;
    }

    async fn send_json<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<Response, SessionError> {
        return self
            .execute(method, path, |req| return Ok(self.with_timeout(req).json(body)))
            .await;
    }

    /// Sends a request to the backend, attaching the CSRF token to mutating
    /// methods and transparently recovering from one 401/403 by refreshing the
    /// session.
    ///
    /// `build` customizes a fresh request on every attempt, so it has to be
    /// replayable: a request is sent at most twice.
    ///
    /// Any non-2xx answer that is not recovered is returned as
    /// `SessionError::Status`.
    pub async fn execute<F>(
        &self,
        method: Method,
        path: &str,
        build: F,
    ) -> Result<Response, SessionError>
    where
        F: Fn(RequestBuilder) -> Result<RequestBuilder, SessionError> + Send + Sync,
    {
        let mut retried = false;

        loop {
            let dispatched_epoch = self.lock_state().epoch;
            let res = self.dispatch(&method, path, &build).await?;
            let status = res.status();

            if status.is_success() {
                return Ok(res);
            }

            if !is_auth_failure(status) || retried || self.is_refresh_path(path) {
                tracing::debug!(
                    method = %method,
                    path,
                    status = status.as_u16(),
                    retried,
                    "Request failed"
                );
                return Err(SessionError::from_response(res).await);
            }

            retried = true;
            if status == StatusCode::FORBIDDEN && is_mutating(&method) {
                // The token may have been rotated by the backend.
                self.invalidate_csrf_token().await;
            }

            tracing::debug!(
                method = %method,
                path,
                status = status.as_u16(),
                "Request was not authorized, recovering session"
            );
            self.recover(dispatched_epoch).await?;
        }
    }

    /// Refreshes the session, joining a refresh that is already in flight
    /// instead of starting another one.
    pub async fn refresh_session(&self) -> Result<(), SessionError> {
        let epoch = self.lock_state().epoch;
        return self.recover(epoch).await;
    }

    /// Returns the cached CSRF token, fetching it on first use. Failures are
    /// logged and yield `None` so the request goes out without the header and
    /// the backend's rejection surfaces through the normal error path.
    pub async fn csrf_token(&self) -> Option<String> {
        let mut cached = self.csrf_token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Some(token.to_string());
        }

        match self.fetch_csrf_token().await {
            Ok(token) => {
                *cached = Some(token.to_string());
                return Some(token);
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to fetch CSRF token, sending request without it");
                return None;
            }
        }
    }

    pub async fn invalidate_csrf_token(&self) {
        *self.csrf_token.lock().await = None;
    }

    pub fn is_signed_out(&self) -> bool {
        return self.lock_state().signed_out;
    }

    async fn recover(&self, dispatched_epoch: u64) -> Result<(), SessionError> {
        loop {
            let recovery = {
                let mut state = self.lock_state();
                if state.signed_out {
                    Recovery::SignedOut
                } else if state.epoch != dispatched_epoch {
                    // Refreshed since this request went out.
                    Recovery::Replay
                } else if state.is_refreshing {
                    let (waiter_tx, waiter_rx) = oneshot::channel();
                    state.pending.push(waiter_tx);
                    Recovery::Wait(waiter_rx)
                } else {
                    state.is_refreshing = true;
                    Recovery::Lead
                }
            };

            match recovery {
                Recovery::Replay => {
                    return Ok(());
                }
                Recovery::SignedOut => {
                    return Err(SessionError::RefreshFailed(
                        "session has ended, sign in again".to_string(),
                    ));
                }
                Recovery::Wait(waiter_rx) => match waiter_rx.await {
                    Ok(RefreshOutcome::Refreshed) => {
                        return Ok(());
                    }
                    Ok(RefreshOutcome::Failed(reason)) => {
                        return Err(SessionError::RefreshFailed(reason));
                    }
                    Ok(RefreshOutcome::Abandoned) | Err(_) => {
                        tracing::debug!("Session refresh was abandoned, recovering again");
                    }
                },
                Recovery::Lead => {
                    return self.lead_refresh().await;
                }
            }
        }
    }

    async fn lead_refresh(&self) -> Result<(), SessionError> {
        let mut guard = RefreshGuard {
            client: self,
            settled: false,
        };

        tracing::debug!(path = %self.config.refresh_path, "Refreshing session");
        let res = self.call_refresh_endpoint().await;
        match res.as_ref() {
            Ok(()) => guard.settle(RefreshOutcome::Refreshed),
            Err(err) => guard.settle(RefreshOutcome::Failed(err.to_string())),
        };

        if let Err(err) = res {
            tracing::warn!(error = %err, "Session refresh failed, sign in required");
            self.redirect_to_sign_in();
            return Err(SessionError::RefreshFailed(err.to_string()));
        }

        return Ok(());
    }

    async fn call_refresh_endpoint(&self) -> Result<(), SessionError> {
        let res = self
            .dispatch(&Method::POST, &self.config.refresh_path, &|req| {
                return Ok(self.with_timeout(req));
            })
            .await?;

        if !res.status().is_success() {
            return Err(SessionError::from_response(res).await);
        }

        return Ok(());
    }

    async fn fetch_csrf_token(&self) -> Result<String, SessionError> {
        let url = self.url(&self.config.csrf_path)?;
        let res = self.with_timeout(self.http.get(url)).send().await?;
        if !res.status().is_success() {
            return Err(SessionError::from_response(res).await);
        }

        let body = res.bytes().await?;
        let token_res: CsrfTokenResponse = serde_json::from_slice(&body)?;

        return Ok(token_res.token);
    }

    async fn dispatch<F>(
        &self,
        method: &Method,
        path: &str,
        build: &F,
    ) -> Result<Response, SessionError>
    where
        F: Fn(RequestBuilder) -> Result<RequestBuilder, SessionError> + Send + Sync,
    {
        let url = self.url(path)?;
        let mut req = self.http.request(method.clone(), url);
        if is_mutating(method) {
            if let Some(token) = self.csrf_token().await {
                req = req.header(CSRF_HEADER, token);
            }
        }

        let res = build(req)?.send().await?;
        tracing::debug!(
            method = %method,
            path,
            status = res.status().as_u16(),
            "Request settled"
        );

        return Ok(res);
    }

    fn redirect_to_sign_in(&self) {
        let event = Event::SignInRequired {
            url: self.config.sign_in_url.to_string(),
        };
        if self.tx.send(event).is_err() {
            tracing::debug!("No listener left for the sign in redirect");
        }
    }

    fn with_timeout(&self, req: RequestBuilder) -> RequestBuilder {
        if let Some(timeout) = self.config.request_timeout {
            return req.timeout(timeout);
        }

        return req;
    }

    fn is_refresh_path(&self, path: &str) -> bool {
        return normalize_path(path) == normalize_path(&self.config.refresh_path);
    }

    fn url(&self, path: &str) -> Result<Url, SessionError> {
        return join_url(&self.config.base_url, path);
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        return self
            .state
            .lock()
            .unwrap_or_else(|poisoned| return poisoned.into_inner());
    }
}

fn is_mutating(method: &Method) -> bool {
    return matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
}

fn is_auth_failure(status: StatusCode) -> bool {
    return status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN;
}

fn normalize_path(path: &str) -> &str {
    let path = path.split('?').next().unwrap_or_default();
    return path.trim_matches('/');
}

/// Resolves `path` against the base URL, keeping any path prefix the base URL
/// carries. Absolute URLs are used as given.
pub fn join_url(base_url: &str, path: &str) -> Result<Url, SessionError> {
    if path.starts_with("http://") || path.starts_with("https://") {
        return Url::parse(path).map_err(|err| return SessionError::InvalidUrl(format!("{path}: {err}")));
    }

    let joined = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );

    return Url::parse(&joined).map_err(|err| return SessionError::InvalidUrl(format!("{joined}: {err}")));
}
