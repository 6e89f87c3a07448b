use crate::constants::RETRYABLE_STATUS_CODES;
use crate::types::{ObservedError, RelayError, Result};
use std::future::Future;
use std::time::Duration;

/// Exponential backoff with ±25% jitter for idempotent-enough upstream calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e) if attempts < self.max_attempts && is_retryable(&e) => {
                    let delay = self.delay_for(attempts);
                    tracing::warn!(
                        "Upstream call failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempts,
                        self.max_attempts,
                        e.inner,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base_delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let jitter_range = base_delay / 4;
        let jitter = if jitter_range > 0 {
            fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
        } else {
            0
        };
        Duration::from_millis((base_delay as i64 + jitter).max(1) as u64)
    }
}

/// Connection failures and allow-listed server statuses are retried;
/// timeouts are not, since each attempt already spent the full budget.
pub fn is_retryable(err: &ObservedError) -> bool {
    match &err.inner {
        RelayError::Network(e) => e.is_connect(),
        RelayError::Upstream(status, _) => RETRYABLE_STATUS_CODES.contains(&status.as_u16()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn only_allow_listed_statuses_retry() {
        let retryable: ObservedError =
            RelayError::Upstream(StatusCode::SERVICE_UNAVAILABLE, String::new()).into();
        let fatal: ObservedError =
            RelayError::Upstream(StatusCode::TOO_MANY_REQUESTS, String::new()).into();
        let timeout: ObservedError = RelayError::UpstreamTimeout(Duration::from_secs(1)).into();

        assert!(is_retryable(&retryable));
        assert!(!is_retryable(&fatal));
        assert!(!is_retryable(&timeout));
    }

    #[test]
    fn delay_grows_with_attempts() {
        let policy = RetryPolicy::new(5, 100);
        let first = policy.delay_for(1);
        let third = policy.delay_for(3);
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));
        assert!(third >= Duration::from_millis(300) && third <= Duration::from_millis(500));
    }
}
