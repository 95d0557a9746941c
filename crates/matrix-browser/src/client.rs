//! Browser Control Client (spec §4.1, §6).
//!
//! A thin client over the external browser-control process's HTTP API,
//! grounded in `riptide_reliability::http_client::HttpClientService`: a
//! `reqwest::Client` wrapped with retry-with-backoff and a circuit breaker,
//! here specialized to the four operations the control API exposes instead
//! of a general `get`/`post`.

use matrix_reliability::{BreakerConfig, BreakerOpenError, CircuitBreaker, RetryPolicy};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ControlApiError {
    #[error("transient control-api failure: {0}")]
    Transient(String),
    #[error("permanent control-api failure: {0}")]
    Permanent(String),
    #[error("circuit breaker open for browser control API")]
    BreakerOpen,
}

impl ControlApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ControlApiError::Transient(_))
    }
}

impl From<BreakerOpenError> for ControlApiError {
    fn from(_: BreakerOpenError) -> Self {
        ControlApiError::BreakerOpen
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenWindowResponse {
    pub window_id: String,
    pub ws: String,
    pub http: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowDescriptor {
    pub window_id: String,
    pub window_name: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: String,
    #[allow(dead_code)]
    msg: String,
}

/// Identifiers the control API accepts for `openWindow`: an existing
/// `windowId`, or the stable `windowName` bound to an account.
#[derive(Debug, Clone)]
pub enum WindowRef {
    Id(String),
    Name(String),
}

pub struct BrowserControlClient {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl BrowserControlClient {
    pub fn new(base_url: impl Into<String>, max_retries: usize, retry_base_ms: u64) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let breaker = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 5,
                ..Default::default()
            },
            Arc::new(matrix_reliability::circuit_breaker::RealClock),
        );
        Ok(Self {
            http,
            base_url: base_url.into(),
            retry: RetryPolicy {
                max_attempts: max_retries.max(1),
                base_ms: retry_base_ms,
                factor: 2.0,
                jitter_fraction: 0.1,
            },
            breaker,
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn open_window(&self, window: WindowRef) -> Result<OpenWindowResponse, ControlApiError> {
        let body = match &window {
            WindowRef::Id(id) => serde_json::json!({ "id": id }),
            WindowRef::Name(name) => serde_json::json!({ "name": name }),
        };
        self.call(|| self.http.post(format!("{}/browser/open", self.base_url)).json(&body).send())
            .await
    }

    pub async fn close_window(&self, window_id: &str) -> Result<(), ControlApiError> {
        let body = serde_json::json!({ "id": window_id });
        let _: serde_json::Value = self
            .call(|| self.http.post(format!("{}/browser/close", self.base_url)).json(&body).send())
            .await?;
        Ok(())
    }

    pub async fn list_windows(&self) -> Result<Vec<WindowDescriptor>, ControlApiError> {
        self.call(|| self.http.get(format!("{}/browser/list", self.base_url)).send()).await
    }

    pub async fn describe_window(&self, window_id: &str) -> Result<WindowDescriptor, ControlApiError> {
        self.call(|| {
            self.http
                .get(format!("{}/browser/details", self.base_url))
                .query(&[("id", window_id)])
                .send()
        })
        .await
    }

    /// Execute `request` with capped exponential backoff (spec §4.1: "3
    /// attempts, base 1s, factor 2, jitter"), short-circuited by the
    /// control-API circuit breaker, classifying transient vs permanent
    /// failures.
    async fn call<T, F, Fut>(&self, request: F) -> Result<T, ControlApiError>
    where
        T: serde::de::DeserializeOwned,
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = reqwest::Result<reqwest::Response>>,
    {
        let permit = self.breaker.try_acquire()?;

        let result = self
            .retry
            .execute(
                |e: &ControlApiError| e.is_transient(),
                || async {
                    let response = request().await.map_err(|e| {
                        if e.is_timeout() || e.is_connect() {
                            ControlApiError::Transient(sanitize(&e.to_string()))
                        } else {
                            ControlApiError::Transient(sanitize(&e.to_string()))
                        }
                    })?;
                    classify_response(response).await
                },
            )
            .await;

        match &result {
            Ok(_) => self.breaker.on_success(),
            Err(ControlApiError::BreakerOpen) => {}
            Err(_) => self.breaker.on_failure(),
        }
        drop(permit);
        result
    }
}

async fn classify_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, ControlApiError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| ControlApiError::Permanent(format!("malformed response body: {e}")));
    }

    let body_text = response.text().await.unwrap_or_default();
    let parsed: Option<ApiErrorBody> = serde_json::from_str(&body_text).ok();
    let code = parsed.as_ref().map(|b| b.code.as_str()).unwrap_or("");

    if status.is_server_error() {
        warn!(status = %status, "transient browser-control API failure");
        return Err(ControlApiError::Transient(format!("{status}: {}", sanitize(&body_text))));
    }

    if status == StatusCode::NOT_FOUND || code == "not_found" || code == "already_open" || code == "invalid" {
        debug!(status = %status, code, "permanent browser-control API failure");
        return Err(ControlApiError::Permanent(format!("{status}: {}", sanitize(&body_text))));
    }

    Err(ControlApiError::Transient(format!("{status}: {}", sanitize(&body_text))))
}

/// Strip anything resembling a credential before it reaches a log line or
/// error message (spec §4.1: "Never logs credentials; sanitizes request
/// bodies in error messages").
fn sanitize(text: &str) -> String {
    const MARKERS: [&str; 4] = ["password", "token", "cookie", "authorization"];
    if MARKERS.iter().any(|m| text.to_lowercase().contains(m)) {
        "[redacted: response body contained credential-like content]".to_string()
    } else {
        text.chars().take(500).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_redacts_credential_like_bodies() {
        assert_eq!(
            sanitize("{\"password\": \"hunter2\"}"),
            "[redacted: response body contained credential-like content]"
        );
        assert_eq!(sanitize("plain text body"), "plain text body");
    }

    #[test]
    fn window_ref_serializes_by_variant() {
        let by_name = WindowRef::Name("acct-1".to_string());
        match by_name {
            WindowRef::Name(n) => assert_eq!(n, "acct-1"),
            _ => panic!("expected Name"),
        }
    }
}
