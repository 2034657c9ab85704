//! Outbound status webhooks with retry.
//!
//! POST `{job_id, status, result?, error?}` to the configured URL with the
//! shared secret header. 5xx and transport errors retry with back-off
//! (1s, 2s, 4s); 4xx other than 408/429 do not.

use serde_json::{Value, json};
use std::time::Duration;

use crate::config::WebhookConfig;

/// Progressive job states surfaced to front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookStatus {
    Processing,
    Parsed,
    Analyzed,
    Completed,
    Failed,
    Rejected,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Parsed => "parsed",
            Self::Analyzed => "analyzed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }
}

pub struct WebhookService {
    http_client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookService {
    pub fn new(http_client: reqwest::Client, config: WebhookConfig) -> Self {
        Self { http_client, config }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.url.is_empty()
    }

    /// Fire-and-forget notification. Failures are logged, never surfaced:
    /// webhook delivery must not fail a pipeline.
    pub async fn notify(
        &self,
        job_id: &str,
        status: WebhookStatus,
        result: Option<Value>,
        error: Option<&str>,
    ) {
        if !self.is_configured() {
            tracing::debug!("[webhook] URL not configured, skipping job {}", job_id);
            return;
        }

        let payload = json!({
            "job_id": job_id,
            "status": status.as_str(),
            "result": result,
            "error": error,
        });

        for attempt in 0..=self.config.max_retries {
            let response = self
                .http_client
                .post(&self.config.url)
                .header("X-Webhook-Secret", &self.config.secret)
                .timeout(Duration::from_secs(self.config.timeout_secs))
                .json(&payload)
                .send()
                .await;

            match response {
                Ok(r) if r.status().is_success() => {
                    tracing::info!("[webhook] notified job {} ({})", job_id, status.as_str());
                    return;
                },
                Ok(r) if !is_retryable_status(r.status()) => {
                    tracing::error!(
                        "[webhook] non-retryable {} for job {}, giving up",
                        r.status(),
                        job_id
                    );
                    return;
                },
                Ok(r) => {
                    tracing::warn!(
                        "[webhook] server error {} (attempt {}/{})",
                        r.status(),
                        attempt + 1,
                        self.config.max_retries + 1
                    );
                },
                Err(e) => {
                    tracing::warn!(
                        "[webhook] transport error for job {} (attempt {}/{}): {}",
                        job_id,
                        attempt + 1,
                        self.config.max_retries + 1,
                        e
                    );
                },
            }

            if attempt < self.config.max_retries {
                let delay = self.config.retry_delay_secs * 2f64.powi(attempt as i32);
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }

        tracing::error!(
            "[webhook] all {} attempts failed for job {}; front-end will not see this update",
            self.config.max_retries + 1,
            job_id
        );
    }
}

/// 4xx are permanent except 408 (request timeout) and 429 (rate limit).
fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));

        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(WebhookStatus::Completed.as_str(), "completed");
        assert_eq!(WebhookStatus::Rejected.as_str(), "rejected");
    }

    #[tokio::test]
    async fn test_unconfigured_notify_is_noop() {
        let svc = WebhookService::new(reqwest::Client::new(), WebhookConfig::default());
        // Must return quickly without retrying
        svc.notify("job-1", WebhookStatus::Completed, None, None).await;
    }
}
