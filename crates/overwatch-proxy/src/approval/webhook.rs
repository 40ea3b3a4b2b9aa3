//! Webhook approval client.
//!
//! POSTs the approval request as JSON, signs the exact serialized body when a
//! secret is configured, retries transport failures with exponential backoff,
//! and fails closed: any error becomes a denial with a `Webhook error: …`
//! reason. The overall timeout cancels the whole attempt sequence.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use overwatch_types::errors::OverwatchError;
use overwatch_types::records::{ApprovalRequest, ApprovalResponse};
use overwatch_types::traits::ApprovalHandler;

use super::signature;

/// Webhook endpoint configuration.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    /// HMAC secret for the `X-Overwatch-Signature` header.
    pub secret: Option<String>,
    /// Overall deadline across all attempts.
    pub timeout: Duration,
    /// First retry delay; doubles per attempt.
    pub retry_base: Duration,
    /// Retry delay cap.
    pub retry_max_delay: Duration,
    /// Total attempts (first try included).
    pub max_attempts: u32,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: None,
            timeout: Duration::from_secs(60),
            retry_base: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

/// Approval handler backed by an HTTP webhook.
pub struct WebhookApprovalHandler {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookApprovalHandler {
    pub fn new(config: WebhookConfig) -> Result<Self, OverwatchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OverwatchError::Approval(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// `min(base · 2^attempt, max_delay)` for zero-based `attempt`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(31);
        let factor = 1u64 << shift;
        self.config
            .retry_base
            .saturating_mul(factor.min(u32::MAX as u64) as u32)
            .min(self.config.retry_max_delay)
    }

    async fn post_once(&self, body: &str) -> Result<ApprovalResponse, OverwatchError> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            // The signed bytes must be exactly the bytes sent.
            .body(body.to_string());
        if let Some(ref secret) = self.config.secret {
            request = request.header(
                signature::SIGNATURE_HEADER,
                signature::signature_header_value(secret.as_bytes(), body.as_bytes()),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(OverwatchError::Approval(format!(
                "webhook returned HTTP {status}"
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| OverwatchError::Approval(format!("failed to read webhook body: {e}")))?;
        // `approved` is required; a body without it is a failure.
        serde_json::from_str::<ApprovalResponse>(&text)
            .map_err(|e| OverwatchError::Approval(format!("bad webhook payload: {e}")))
    }

    async fn post_with_retries(&self, body: &str) -> Result<ApprovalResponse, OverwatchError> {
        let mut last_error = OverwatchError::Approval("no attempts made".to_string());
        for attempt in 0..self.config.max_attempts {
            match self.post_once(body).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    // Cancellation-type errors are not retried; the caller's
                    // deadline owns them.
                    let cancelled = matches!(e, OverwatchError::Timeout(_));
                    warn!(
                        attempt = attempt + 1,
                        max = self.config.max_attempts,
                        error = %e,
                        "webhook attempt failed"
                    );
                    last_error = e;
                    if cancelled || attempt + 1 >= self.config.max_attempts {
                        break;
                    }
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                }
            }
        }
        Err(last_error)
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> OverwatchError {
    if e.is_timeout() {
        OverwatchError::Timeout(format!("webhook request timed out: {e}"))
    } else {
        OverwatchError::Approval(format!("webhook request failed: {e}"))
    }
}

#[async_trait]
impl ApprovalHandler for WebhookApprovalHandler {
    async fn request_approval(
        &self,
        request: ApprovalRequest,
    ) -> Result<ApprovalResponse, OverwatchError> {
        let body = serde_json::to_string(&request).map_err(OverwatchError::from)?;
        debug!(url = %self.config.url, request = %request.id, "posting approval request");

        let outcome =
            tokio::time::timeout(self.config.timeout, self.post_with_retries(&body)).await;
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                warn!(request = %request.id, error = %e, "webhook approval failed closed");
                Ok(ApprovalResponse::denied(format!("Webhook error: {e}")))
            }
            Err(_) => {
                warn!(request = %request.id, "webhook approval timed out, failing closed");
                Ok(ApprovalResponse::denied(format!(
                    "Webhook error: no decision within {:?}",
                    self.config.timeout
                )))
            }
        }
    }

    async fn close(&self) {}
}
