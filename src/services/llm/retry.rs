//! Exponential back-off retry around a single provider call.
//!
//! Base 1s, factor 2, capped, with jitter in [0, 1). Only errors matching
//! the retryable pattern are retried; auth, validation and JSON errors
//! return immediately.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::future::Future;
use std::time::Duration;

use super::models::LlmResponse;

static RETRYABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)timeout|rate[_ ]limit|429|5\d\d|overloaded|capacity|temporarily unavailable|connection|network",
    )
    .expect("static regex")
});

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay_secs: 1.0, max_delay_secs: 8.0 }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based), jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let delay =
            (self.base_delay_secs * 2f64.powi(attempt as i32) + jitter).min(self.max_delay_secs);
        Duration::from_secs_f64(delay)
    }
}

pub fn is_retryable(error_message: &str) -> bool {
    !error_message.is_empty() && RETRYABLE.is_match(error_message)
}

/// Run `call` until it succeeds, fails permanently, or exhausts the retry
/// budget. `call` receives the attempt number (0 = first try).
pub async fn call_with_retry<F, Fut>(label: &str, policy: BackoffPolicy, call: F) -> LlmResponse
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = LlmResponse>,
{
    let mut last_response = None;

    for attempt in 0..=policy.max_retries {
        let response = call(attempt).await;

        if response.success() {
            if attempt > 0 {
                tracing::info!("[retry] {} succeeded after {} retries", label, attempt);
            }
            return response;
        }

        let error = response.error.clone().unwrap_or_default();
        if !is_retryable(&error) {
            tracing::debug!("[retry] {} error is not retryable: {}", label, error);
            return response;
        }

        last_response = Some(response);

        if attempt >= policy.max_retries {
            tracing::warn!("[retry] {} exhausted {} retries", label, policy.max_retries);
            break;
        }

        let delay = policy.delay_for(attempt);
        tracing::warn!(
            "[retry] {} retryable error, waiting {:.1}s ({}/{}): {}",
            label,
            delay.as_secs_f64(),
            attempt + 1,
            policy.max_retries,
            error
        );
        tokio::time::sleep(delay).await;
    }

    last_response.expect("at least one attempt was made")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::models::LlmProvider;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ok_response() -> LlmResponse {
        LlmResponse {
            provider: LlmProvider::Openai,
            content: Some(json!({})),
            raw_text: "{}".to_string(),
            model: "test".to_string(),
            usage: None,
            error: None,
        }
    }

    #[test]
    fn test_retryable_classifier() {
        assert!(is_retryable("Request timeout"));
        assert!(is_retryable("rate limit exceeded"));
        assert!(is_retryable("rate_limit"));
        assert!(is_retryable("HTTP 429"));
        assert!(is_retryable("server returned 503"));
        assert!(is_retryable("model overloaded"));
        assert!(is_retryable("at capacity"));
        assert!(is_retryable("temporarily unavailable"));
        assert!(is_retryable("connection reset"));
        assert!(is_retryable("network unreachable"));

        assert!(!is_retryable("invalid api key"));
        assert!(!is_retryable("401 unauthorized"));
        assert!(!is_retryable("JSON parse error: expected value"));
        assert!(!is_retryable(""));
    }

    #[test]
    fn test_delay_growth_and_cap() {
        let policy = BackoffPolicy::default();
        // attempt 0: 1s + jitter < 2s
        let d0 = policy.delay_for(0).as_secs_f64();
        assert!((1.0..2.0).contains(&d0));
        // attempt 1: 2s + jitter < 3s
        let d1 = policy.delay_for(1).as_secs_f64();
        assert!((2.0..3.0).contains(&d1));
        // attempt 5 capped at 8s
        let d5 = policy.delay_for(5).as_secs_f64();
        assert!(d5 <= 8.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let response = call_with_retry("test", BackoffPolicy::default(), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    LlmResponse::failure(LlmProvider::Openai, "test", "HTTP 504 gateway timeout")
                } else {
                    ok_response()
                }
            }
        })
        .await;

        assert!(response.success());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let response = call_with_retry("test", BackoffPolicy::default(), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                LlmResponse::failure(LlmProvider::Openai, "test", "invalid api key")
            }
        })
        .await;

        assert!(!response.success());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_budget() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let response = call_with_retry("test", BackoffPolicy::default(), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                LlmResponse::failure(LlmProvider::Openai, "test", "503 unavailable")
            }
        })
        .await;

        assert!(!response.success());
        // initial try + 3 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
