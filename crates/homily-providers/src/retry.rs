//! Retry with exponential backoff for idempotent provider POSTs.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{sanitize_body, ProviderError};

/// Backoff policy for provider requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on every further attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Create a policy from millisecond settings.
    pub fn from_millis(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// Only 5xx and 429 are worth retrying; every other 4xx is final.
    pub fn is_retryable_status(status: StatusCode) -> bool {
        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
    }
}

/// POST a JSON body with bearer auth, retrying transient failures.
///
/// Returns the raw response body of the first 2xx answer.
pub(crate) async fn post_json_with_retry<B>(
    client: &Client,
    service: &'static str,
    url: &str,
    api_key: &str,
    body: &B,
    policy: &RetryPolicy,
) -> Result<String, ProviderError>
where
    B: Serialize + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(service, attempt, max_attempts, "Sending provider request");

        let result = client
            .post(url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await;

        let (status, detail, retry_after) = match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.text().await.map_err(|e| {
                        ProviderError::InvalidResponse {
                            service,
                            detail: sanitize_body(&e.to_string(), Some(api_key)),
                        }
                    });
                }

                let retry_after = retry_after(&response);
                let text = response.text().await.unwrap_or_default();
                let text = sanitize_body(&text, Some(api_key));

                if !RetryPolicy::is_retryable_status(status) {
                    return Err(ProviderError::Rejected {
                        service,
                        status: status.as_u16(),
                        body: text,
                    });
                }
                (Some(status.as_u16()), text, retry_after)
            }
            // Timeouts and connection failures are transient like a 5xx.
            Err(e) => (
                e.status().map(|s| s.as_u16()),
                sanitize_body(&e.without_url().to_string(), Some(api_key)),
                None,
            ),
        };

        if attempt >= max_attempts {
            return Err(ProviderError::Transient {
                service,
                status,
                body: detail,
                attempts: attempt,
            });
        }

        let delay = retry_after
            .map(|d| d.min(policy.max_delay))
            .unwrap_or_else(|| policy.delay_for(attempt));
        warn!(
            service,
            status = ?status,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Transient provider failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(8));
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(8));
        assert_eq!(policy.delay_for(40), Duration::from_secs(8));
    }

    #[test]
    fn test_from_millis_keeps_at_least_one_attempt() {
        let policy = RetryPolicy::from_millis(0, 10, 40);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(RetryPolicy::is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(RetryPolicy::is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(RetryPolicy::is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(RetryPolicy::is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!RetryPolicy::is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!RetryPolicy::is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!RetryPolicy::is_retryable_status(StatusCode::NOT_FOUND));
    }
}
