use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use relay_queue::error::QueueError;
use relay_queue::hooks::TransactionContext;
use relay_queue::job::{BorrowedJob, JobError, JobResult, RequeuePosition, ToJobResult};
use relay_queue::{DurableExecution, FailHookData, NackHookData, SuccessHookData, UserCancellable};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

pub mod envelope;
pub mod notifier;

pub use notifier::{TransactionNotifier, WebhookNotifier, WebhookTarget};

pub const SIGNATURE_HEADER_NAME: &str = "x-signature-sha256";
pub const TIMESTAMP_HEADER_NAME: &str = "x-request-timestamp";

const BODY_PREVIEW_LIMIT: usize = 512;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WebhookRetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for WebhookRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_factor: 2.0,
        }
    }
}

impl WebhookRetryConfig {
    /// Backoff before delivery attempt `attempt + 1`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_factor.powi(exponent);
        Duration::from_millis(delay_ms.min(self.max_delay_ms as f64) as u64)
    }
}

pub struct WebhookJobHandler {
    pub http_client: reqwest::Client,
    pub retry_config: WebhookRetryConfig,
}

impl WebhookJobHandler {
    pub fn new(http_client: reqwest::Client, retry_config: WebhookRetryConfig) -> Self {
        Self {
            http_client,
            retry_config,
        }
    }

    fn retry_or_fail<T>(&self, attempts: u32, error: WebhookError) -> JobResult<T, WebhookError> {
        if attempts < self.retry_config.max_attempts {
            let delay = self.retry_config.delay_after(attempts);
            tracing::warn!(
                attempt = attempts,
                max_attempts = self.retry_config.max_attempts,
                delay_ms = delay.as_millis(),
                error = %error,
                "Webhook delivery failed, retrying"
            );
            Err(JobError::Nack {
                error,
                delay: Some(delay),
                position: RequeuePosition::Last,
            })
        } else {
            tracing::error!(attempt = attempts, error = %error, "Webhook delivery failed after max attempts");
            Err(JobError::Fail(error))
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WebhookJobPayload {
    pub url: String,
    /// Pre-serialized JSON.
    pub body: String,
    pub headers: Option<HashMap<String, String>>,
    pub hmac_secret: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WebhookJobOutput {
    pub status_code: u16,
    pub response_body: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, thiserror::Error)]
#[serde(
    rename_all = "SCREAMING_SNAKE_CASE",
    tag = "errorCode",
    content = "message"
)]
pub enum WebhookError {
    #[error("Network error during webhook dispatch: {0}")]
    Network(String),

    #[error("Failed to construct webhook request: {0}")]
    RequestConstruction(String),

    #[error("HMAC signature generation failed: {0}")]
    HmacGeneration(String),

    #[error("Webhook request timed out: {0}")]
    Timeout(String),

    #[error("HTTP error from endpoint: status {status}, body: {body_preview}")]
    Http { status: u16, body_preview: String },

    #[error("Internal queue error: {0}")]
    InternalQueueError(String),

    #[error("Webhook delivery cancelled")]
    UserCancelled,
}

impl From<QueueError> for WebhookError {
    fn from(error: QueueError) -> Self {
        WebhookError::InternalQueueError(error.to_string())
    }
}

impl UserCancellable for WebhookError {
    fn user_cancelled() -> Self {
        WebhookError::UserCancelled
    }
}

/// Hex HMAC-SHA256 of `"{timestamp}.{body}"`.
pub fn sign_payload(secret: &str, timestamp: &str, body: &str) -> Result<String, WebhookError> {
    if secret.is_empty() {
        return Err(WebhookError::HmacGeneration(
            "HMAC secret cannot be empty".to_string(),
        ));
    }

    type HmacSha256 = Hmac<sha2::Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::HmacGeneration(format!("Failed to initialize HMAC: {e}")))?;
    mac.update(format!("{timestamp}.{body}").as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, WebhookError> {
    HeaderValue::from_str(value).map_err(|e| {
        WebhookError::RequestConstruction(format!("Invalid header value for '{name}': {e}"))
    })
}

fn build_headers(payload: &WebhookJobPayload) -> Result<HeaderMap, WebhookError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );

    for (key, value) in payload.headers.iter().flatten() {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
            WebhookError::RequestConstruction(format!("Invalid header name '{key}': {e}"))
        })?;
        headers.insert(name, header_value(key, value)?);
    }

    if let Some(secret) = &payload.hmac_secret {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| WebhookError::RequestConstruction(format!("System clock error: {e}")))?
            .as_secs()
            .to_string();
        let signature = sign_payload(secret, &timestamp, &payload.body)?;

        headers.insert(
            HeaderName::from_static(SIGNATURE_HEADER_NAME),
            header_value(SIGNATURE_HEADER_NAME, &signature)?,
        );
        headers.insert(
            HeaderName::from_static(TIMESTAMP_HEADER_NAME),
            header_value(TIMESTAMP_HEADER_NAME, &timestamp)?,
        );
    }

    Ok(headers)
}

fn preview(body: Option<String>) -> String {
    match body {
        Some(text) if text.len() > BODY_PREVIEW_LIMIT => {
            let cut = (0..=BODY_PREVIEW_LIMIT)
                .rev()
                .find(|i| text.is_char_boundary(*i))
                .unwrap_or(0);
            format!("{}...", &text[..cut])
        }
        Some(text) => text,
        None => "No body or failed to read body".to_string(),
    }
}

impl DurableExecution for WebhookJobHandler {
    type Output = WebhookJobOutput;
    type ErrorData = WebhookError;
    type JobData = WebhookJobPayload;

    #[tracing::instrument(skip_all, fields(queue = "webhook", job_id = job.job.id))]
    async fn process(
        &self,
        job: &BorrowedJob<Self::JobData>,
    ) -> JobResult<Self::Output, Self::ErrorData> {
        let payload = &job.job.data;
        let headers = build_headers(payload).map_err_fail()?;

        tracing::debug!(url = payload.url, attempt = job.job.attempts, "Sending webhook request");

        let response = match self
            .http_client
            .post(&payload.url)
            .headers(headers)
            .body(payload.body.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return self.retry_or_fail(job.job.attempts, WebhookError::Timeout(e.to_string()));
            }
            Err(e) if e.is_connect() || e.is_request() => {
                return self.retry_or_fail(job.job.attempts, WebhookError::Network(e.to_string()));
            }
            Err(e) => return Err(JobError::Fail(WebhookError::RequestConstruction(e.to_string()))),
        };

        let status = response.status();
        let body = response.text().await.ok();

        if status.is_success() {
            tracing::info!(status = status.as_u16(), "Webhook delivered");
            return Ok(WebhookJobOutput {
                status_code: status.as_u16(),
                response_body: body,
            });
        }

        let error = WebhookError::Http {
            status: status.as_u16(),
            body_preview: preview(body),
        };

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            self.retry_or_fail(job.job.attempts, error)
        } else {
            tracing::error!(status = status.as_u16(), "Webhook rejected by endpoint");
            Err(JobError::Fail(error))
        }
    }

    async fn on_success(
        &self,
        job: &BorrowedJob<Self::JobData>,
        d: SuccessHookData<'_, Self::Output>,
        _tx: &mut TransactionContext<'_>,
    ) {
        tracing::debug!(
            job_id = job.job.id,
            url = job.job.data.url,
            status = d.result.status_code,
            "Webhook job completed"
        );
    }

    async fn on_nack(
        &self,
        job: &BorrowedJob<Self::JobData>,
        d: NackHookData<'_, Self::ErrorData>,
        _tx: &mut TransactionContext<'_>,
    ) {
        tracing::debug!(
            job_id = job.job.id,
            url = job.job.data.url,
            attempt = job.job.attempts,
            delay_ms = d.delay.map_or(0, |dur| dur.as_millis()),
            "Webhook job requeued"
        );
    }

    async fn on_fail(
        &self,
        job: &BorrowedJob<Self::JobData>,
        d: FailHookData<'_, Self::ErrorData>,
        _tx: &mut TransactionContext<'_>,
    ) {
        tracing::error!(
            job_id = job.job.id,
            url = job.job.data.url,
            attempt = job.job.attempts,
            error = ?d.error,
            "Webhook permanently failed"
        );
    }
}
