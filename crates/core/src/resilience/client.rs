//! Outbound HTTP calls with timeout, retry and rate-limit handling.

use crate::error::ResilienceError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    Client, Method, Response, StatusCode,
    header::{HeaderMap, RETRY_AFTER},
    multipart,
};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{error, warn};

/// Delay used when a 429 response carries no usable `Retry-After` header.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

const ERROR_BODY_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 2.0,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// `backoff_factor ^ attempt` seconds, with `attempt` counted from zero.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let secs = self.backoff_factor.powi(attempt as i32).max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }
}

/// One file field of a multipart form.
#[derive(Debug, Clone)]
pub struct FilePart {
    pub name: String,
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

/// Request payload. Kept as data so every attempt can rebuild it.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Multipart(Vec<FilePart>),
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub endpoint: String,
    pub body: RequestBody,
    pub bearer: Option<String>,
}

impl OutboundRequest {
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            endpoint: endpoint.into(),
            body: RequestBody::Empty,
            bearer: None,
        }
    }

    pub fn post_json(endpoint: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            endpoint: endpoint.into(),
            body: RequestBody::Json(body),
            bearer: None,
        }
    }

    pub fn post_multipart(endpoint: impl Into<String>, parts: Vec<FilePart>) -> Self {
        Self {
            method: Method::POST,
            endpoint: endpoint.into(),
            body: RequestBody::Multipart(parts),
            bearer: None,
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

/// Why a single attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    Timeout,
    RateLimited { retry_after: u64 },
    Server { status: u16, body: String },
    Transport(String),
}

/// Bookkeeping for one `request_with_retry` invocation.
#[derive(Debug, Default)]
struct RetryContext {
    attempt: u32,
    elapsed_backoff: Duration,
    last_failure: Option<AttemptFailure>,
}

/// Pause between attempts. Swappable so tests can observe exact delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// HTTP client bound to one external service.
///
/// The connection pool lives as long as the client; clone the client (it is
/// cheap) rather than building a new one per call.
#[derive(Clone)]
pub struct ResilientClient {
    service: String,
    base_url: String,
    http: Client,
    sleeper: Arc<dyn Sleeper>,
}

impl ResilientClient {
    pub fn new(
        service: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ResilienceError> {
        let service = service.into();
        let http = Client::builder()
            .pool_max_idle_per_host(20)
            .build()
            .map_err(|e| ResilienceError::InvalidRequest {
                service: service.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            service,
            base_url: base_url.into(),
            http,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("{}{}", self.base_url.trim_end_matches('/'), endpoint)
        }
    }

    fn build(
        &self,
        request: &OutboundRequest,
        timeout: Duration,
    ) -> Result<reqwest::RequestBuilder, ResilienceError> {
        let mut builder = self
            .http
            .request(request.method.clone(), self.url(&request.endpoint))
            .timeout(timeout);
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }

        let builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Multipart(parts) => {
                let mut form = multipart::Form::new();
                for part in parts {
                    let field = multipart::Part::bytes(part.data.to_vec())
                        .file_name(part.file_name.clone())
                        .mime_str(&part.content_type)
                        .map_err(|e| ResilienceError::InvalidRequest {
                            service: self.service.clone(),
                            message: e.to_string(),
                        })?;
                    form = form.part(part.name.clone(), field);
                }
                builder.multipart(form)
            }
        };
        Ok(builder)
    }

    /// Sends `request`, retrying retryable failures according to `policy`.
    ///
    /// * 429 waits exactly `Retry-After` seconds (60 when absent).
    /// * Other 4xx fail immediately.
    /// * 5xx, timeouts and transport errors wait `backoff_factor ^ attempt` seconds.
    pub async fn request_with_retry(
        &self,
        request: &OutboundRequest,
        policy: &RetryPolicy,
    ) -> Result<Response, ResilienceError> {
        let max_attempts = policy.max_retries.max(1);
        let mut ctx = RetryContext::default();

        loop {
            let has_next = ctx.attempt + 1 < max_attempts;
            let failure = match self.build(request, policy.timeout)?.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = parse_retry_after(response.headers());
                        warn!(
                            service = %self.service,
                            endpoint = %request.endpoint,
                            retry_after,
                            attempt = ctx.attempt + 1,
                            "Rate limited by external service"
                        );
                        if !has_next {
                            return Err(ResilienceError::RateLimited {
                                service: self.service.clone(),
                                retry_after,
                            });
                        }
                        let delay = Duration::from_secs(retry_after);
                        ctx.elapsed_backoff += delay;
                        ctx.last_failure = Some(AttemptFailure::RateLimited { retry_after });
                        self.sleeper.sleep(delay).await;
                        ctx.attempt += 1;
                        continue;
                    }
                    if status.is_client_error() {
                        let body = preview(response).await;
                        error!(
                            service = %self.service,
                            endpoint = %request.endpoint,
                            status = status.as_u16(),
                            detail = %body,
                            "External service client error"
                        );
                        return Err(ResilienceError::ClientError {
                            service: self.service.clone(),
                            status: status.as_u16(),
                            body,
                        });
                    }
                    if !status.is_server_error() {
                        return Ok(response);
                    }
                    AttemptFailure::Server {
                        status: status.as_u16(),
                        body: preview(response).await,
                    }
                }
                Err(e) if e.is_timeout() => AttemptFailure::Timeout,
                Err(e) => AttemptFailure::Transport(e.to_string()),
            };

            warn!(
                service = %self.service,
                endpoint = %request.endpoint,
                attempt = ctx.attempt + 1,
                max_retries = max_attempts,
                failure = ?failure,
                "Retryable failure calling external service"
            );

            if !has_next {
                error!(
                    service = %self.service,
                    endpoint = %request.endpoint,
                    attempts = ctx.attempt + 1,
                    elapsed_backoff_ms = ctx.elapsed_backoff.as_millis() as u64,
                    previous_failure = ?ctx.last_failure,
                    "External service retries exhausted"
                );
                return Err(self.exhausted(&request.endpoint, failure));
            }

            let delay = policy.backoff_for(ctx.attempt);
            ctx.elapsed_backoff += delay;
            ctx.last_failure = Some(failure);
            self.sleeper.sleep(delay).await;
            ctx.attempt += 1;
        }
    }

    fn exhausted(&self, endpoint: &str, failure: AttemptFailure) -> ResilienceError {
        let service = self.service.clone();
        match failure {
            AttemptFailure::Timeout => ResilienceError::Timeout {
                service,
                endpoint: endpoint.to_string(),
            },
            AttemptFailure::RateLimited { retry_after } => ResilienceError::RateLimited {
                service,
                retry_after,
            },
            AttemptFailure::Server { status, body } => ResilienceError::ServerError {
                service,
                status,
                body,
            },
            AttemptFailure::Transport(message) => ResilienceError::Transport { service, message },
        }
    }
}

/// Seconds from a `Retry-After` header, or the default when absent or invalid.
pub fn parse_retry_after(headers: &HeaderMap) -> u64 {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

async fn preview(response: Response) -> String {
    response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(ERROR_BODY_PREVIEW_CHARS)
        .collect()
}
