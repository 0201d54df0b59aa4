//! JSON-over-HTTP transport, retry/backoff and request pacing for staysync.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub use reqwest::{Method, StatusCode};

pub const CRATE_NAME: &str = "staysync-transport";

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub bearer_token: Option<String>,
    pub body: Option<JsonValue>,
}

impl JsonRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            bearer_token: None,
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: JsonValue) -> Self {
        Self::new(Method::POST, url).with_body(body)
    }

    pub fn patch(url: impl Into<String>, body: JsonValue) -> Self {
        Self::new(Method::PATCH, url).with_body(body)
    }

    pub fn with_body(mut self, body: JsonValue) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonResponse {
    pub status: StatusCode,
    pub body: JsonValue,
    /// Server-requested wait, when a `Retry-After` header was sent.
    pub retry_after: Option<Duration>,
}

impl JsonResponse {
    pub fn new(status: StatusCode, body: JsonValue) -> Self {
        Self {
            status,
            body,
            retry_after: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {message}")]
    Request {
        url: String,
        message: String,
        retryable: bool,
    },
    #[error("response from {url} is not valid JSON: {message}")]
    InvalidBody { url: String, message: String },
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Request { retryable: true, .. })
    }
}

/// "Send JSON, get JSON" capability the source and sink clients are built on.
#[async_trait]
pub trait JsonTransport: Send + Sync {
    async fn send(&self, request: &JsonRequest) -> Result<JsonResponse, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_rate_limit_only(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Which statuses to retry, how long to wait, and how many times.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: BackoffPolicy,
    pub classify: fn(StatusCode) -> RetryDisposition,
    /// Resend after a retryable transport error. Off for non-idempotent requests.
    pub retry_transport_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            classify: classify_status,
            retry_transport_errors: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(backoff: BackoffPolicy, classify: fn(StatusCode) -> RetryDisposition) -> Self {
        Self {
            backoff,
            classify,
            retry_transport_errors: true,
        }
    }

    /// Same schedule, resending only on 429.
    pub fn rate_limited_only(mut self) -> Self {
        self.classify = classify_rate_limit_only;
        self.retry_transport_errors = false;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.backoff.max_retries = max_retries;
        self
    }

    fn wait_for(&self, attempt_index: usize, retry_after: Option<Duration>) -> Duration {
        let scheduled = self.backoff.delay_for_attempt(attempt_index);
        retry_after
            .map_or(scheduled, |d| d.max(scheduled))
            .min(self.backoff.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("still getting http {status} after {attempts} attempts")]
    Exhausted { status: StatusCode, attempts: usize },
    #[error("transport failed after {attempts} attempts: {error}")]
    Transport {
        error: TransportError,
        attempts: usize,
    },
}

impl RetryError {
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Transport { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Sends `request`, sleeping and resending while the policy calls the outcome retryable.
///
/// Non-retryable responses are returned as-is so callers can interpret them.
pub async fn send_with_retry(
    transport: &dyn JsonTransport,
    request: &JsonRequest,
    policy: &RetryPolicy,
) -> Result<JsonResponse, RetryError> {
    let max_retries = policy.backoff.max_retries;
    let mut attempt = 0usize;

    loop {
        match transport.send(request).await {
            Ok(resp) => {
                if (policy.classify)(resp.status) == RetryDisposition::NonRetryable {
                    return Ok(resp);
                }
                if attempt >= max_retries {
                    return Err(RetryError::Exhausted {
                        status: resp.status,
                        attempts: attempt + 1,
                    });
                }
                let wait = policy.wait_for(attempt, resp.retry_after);
                warn!(
                    url = %request.url,
                    status = %resp.status,
                    attempt = attempt + 1,
                    wait_ms = wait.as_millis() as u64,
                    "retryable response, backing off"
                );
                tokio::time::sleep(wait).await;
            }
            Err(err) => {
                if !err.is_retryable() || !policy.retry_transport_errors || attempt >= max_retries {
                    return Err(RetryError::Transport {
                        error: err,
                        attempts: attempt + 1,
                    });
                }
                let wait = policy.backoff.delay_for_attempt(attempt);
                warn!(
                    url = %request.url,
                    error = %err,
                    attempt = attempt + 1,
                    wait_ms = wait.as_millis() as u64,
                    "request failed, backing off"
                );
                tokio::time::sleep(wait).await;
            }
        }
        attempt += 1;
    }
}

/// Enforces a minimum spacing between consecutive calls to [`RequestPacer::pace`].
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub async fn pace(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
        }
    }
}

/// [`JsonTransport`] over a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpJsonClient {
    client: reqwest::Client,
}

impl HttpJsonClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    fn request_error(url: &str, err: reqwest::Error) -> TransportError {
        TransportError::Request {
            url: url.to_string(),
            retryable: classify_reqwest_error(&err) == RetryDisposition::Retryable,
            message: err.to_string(),
        }
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[async_trait]
impl JsonTransport for HttpJsonClient {
    async fn send(&self, request: &JsonRequest) -> Result<JsonResponse, TransportError> {
        let span = info_span!("json_request", method = %request.method, url = %request.url);
        async {
            let mut builder = self.client.request(request.method.clone(), &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(token) = &request.bearer_token {
                builder = builder.bearer_auth(token);
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let resp = builder
                .send()
                .await
                .map_err(|e| Self::request_error(&request.url, e))?;
            let status = resp.status();
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| Self::request_error(&request.url, e))?;
            debug!(status = %status, bytes = bytes.len(), "received response");

            let body = if bytes.is_empty() {
                JsonValue::Null
            } else {
                match serde_json::from_slice::<JsonValue>(&bytes) {
                    Ok(value) => value,
                    // error pages are often plain text; keep them for diagnostics
                    Err(_) if !status.is_success() => {
                        JsonValue::String(String::from_utf8_lossy(&bytes).into_owned())
                    }
                    Err(err) => {
                        return Err(TransportError::InvalidBody {
                            url: request.url.clone(),
                            message: err.to_string(),
                        })
                    }
                }
            };

            Ok(JsonResponse {
                status,
                body,
                retry_after,
            })
        }
        .instrument(span)
        .await
    }
}
