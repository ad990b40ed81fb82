//! HTTP client for the knowledge-store API.
//!
//! Every tool operation ends up here as a [`BackendRequest`]. The credential
//! travels inside the request value, so concurrent calls with different tokens
//! never touch shared client state.
//!
//! # Retries
//!
//! Timeouts, connection failures and 5xx responses are retried with
//! exponential backoff (`retry_base * 2^attempt`) up to `max_retries` extra
//! attempts. 4xx responses fail immediately.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::logging;

const HEALTH_PATH: &str = "healthcheck";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const RELEASE_MESSAGE_LIMIT: usize = 256;

/// Errors returned by the knowledge-store API or while talking to it
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Backend returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Backend rejected request ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("Invalid backend response: {0}")]
    Decode(String),

    #[error("Invalid backend request: {0}")]
    InvalidRequest(String),
}

impl BackendError {
    /// Whether the same request may succeed if sent again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout(_) | BackendError::Network(_) | BackendError::Server { .. }
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Server { status, .. } | BackendError::Client { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// A single call against the knowledge-store API.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    pub method: Method,
    /// Path segments, percent-encoded when the URL is built.
    pub segments: Vec<String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Per-request credential; wins over the client's static default.
    pub credential: Option<String>,
}

impl BackendRequest {
    pub fn new<I, S>(method: Method, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            method,
            segments: segments.into_iter().map(Into::into).collect(),
            query: Vec::new(),
            body: None,
            credential: None,
        }
    }

    pub fn get<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::GET, segments)
    }

    pub fn post<I, S>(segments: I, body: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::POST, segments).with_body(body)
    }

    pub fn put<I, S>(segments: I, body: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::PUT, segments).with_body(body)
    }

    pub fn delete<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::DELETE, segments)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_credential(mut self, credential: Option<String>) -> Self {
        self.credential = credential;
        self
    }

    /// Display form used in logs, e.g. `/episodes/proj-a`.
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }
}

/// The knowledge store as seen by the tool dispatcher.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KnowledgeBackend: Send + Sync {
    /// Execute a request and return the decoded JSON body.
    async fn send(&self, request: BackendRequest) -> Result<Value, BackendError>;

    /// Check backend liveness, returning the round-trip latency.
    async fn health(&self) -> Result<Duration, BackendError>;
}

/// reqwest-based [`KnowledgeBackend`].
///
/// Cheap to clone; the underlying client pools connections.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    default_token: Option<String>,
    timeout: Duration,
    max_retries: u32,
    retry_base: Duration,
}

impl HttpBackend {
    pub fn new(
        base_url: &str,
        default_token: Option<String>,
        timeout: Duration,
        max_retries: u32,
        retry_base: Duration,
    ) -> Result<Self, BackendError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| BackendError::InvalidRequest(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidRequest(format!(
                "{} cannot be used as a base URL",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            default_token,
            timeout,
            max_retries,
            retry_base,
        })
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, BackendError> {
        Self::new(
            &config.backend_url,
            config.backend_token.clone(),
            config.backend_timeout,
            config.backend_max_retries,
            config.backend_retry_base,
        )
    }

    fn url_for(&self, segments: &[String]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidRequest("base URL has no path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base.saturating_mul(2u32.saturating_pow(attempt))
    }

    async fn send_once(&self, request: &BackendRequest) -> Result<Value, BackendError> {
        let url = self.url_for(&request.segments)?;

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .timeout(self.timeout);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(token) = request
            .credential
            .as_deref()
            .or(self.default_token.as_deref())
        {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.classify(e))?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text)
                .map_err(|e| BackendError::Decode(format!("{} (status {})", e, status.as_u16())));
        }

        let message = error_message(&text);
        if status.is_client_error() {
            Err(BackendError::Client {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(BackendError::Server {
                status: status.as_u16(),
                message,
            })
        }
    }

    fn classify(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout(self.timeout)
        } else if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl KnowledgeBackend for HttpBackend {
    async fn send(&self, request: BackendRequest) -> Result<Value, BackendError> {
        let path = request.path();
        debug!(
            method = %request.method,
            path = %path,
            credential = %request
                .credential
                .as_deref()
                .map(logging::fingerprint)
                .unwrap_or_else(|| "default".to_string()),
            "Sending backend request"
        );

        let mut attempt = 0;
        loop {
            match self.send_once(&request).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    warn!(
                        method = %request.method,
                        path = %path,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying backend request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn health(&self) -> Result<Duration, BackendError> {
        let url = self.url_for(&[HEALTH_PATH.to_string()])?;
        let started = Instant::now();

        let response = self
            .client
            .get(url)
            .timeout(self.timeout.min(HEALTH_TIMEOUT))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if status.is_success() {
            Ok(started.elapsed())
        } else {
            Err(BackendError::Server {
                status: status.as_u16(),
                message: "health check failed".to_string(),
            })
        }
    }
}

/// Pull a readable message out of an error body, truncated outside debug builds.
fn error_message(body: &str) -> String {
    let message = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => match map.get("detail").or_else(|| map.get("message")) {
            Some(Value::String(detail)) => detail.clone(),
            Some(other) => logging::redact(other).to_string(),
            None => logging::redact(&Value::Object(map)).to_string(),
        },
        _ => body.trim().to_string(),
    };

    if cfg!(debug_assertions) {
        message
    } else {
        logging::truncate(&message, RELEASE_MESSAGE_LIMIT)
    }
}
