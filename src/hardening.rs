use crate::constants::RETRYABLE_STATUS_CODES;
use crate::types::{RelayError, Result};
use std::future::Future;
use std::time::Duration;

/// Retries the non-streaming upstream call. Streaming attempts never go through here.
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

    /// `retries` extra attempts after the first one.
    pub fn with_retries(retries: u32, base_delay_ms: u64) -> Self {
        Self::new(retries.saturating_add(1), base_delay_ms)
    }

    /// Delay before attempt `attempts + 1`: base, 2×base, 4×base, ... with ±25% jitter.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        let base_delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(i64::MAX as u64);
        let jitter_range = base_delay / 4;
        let jitter = if jitter_range > 0 {
            fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
        } else {
            0
        };
        Duration::from_millis((base_delay as i64).saturating_add(jitter).max(1) as u64)
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
                Err(e) if attempts < self.max_attempts && Self::is_retryable(&e.inner) => {
                    let delay = self.backoff(attempts);
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

    pub fn is_retryable(err: &RelayError) -> bool {
        match err {
            RelayError::Network(_) | RelayError::Io(_) | RelayError::Timeout(_) => true,
            RelayError::Upstream(status, _) => RETRYABLE_STATUS_CODES.contains(&status.as_u16()),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_backoff_doubles_within_jitter() {
        let policy = RetryPolicy::new(4, 500);
        let first = policy.backoff(1).as_millis();
        let second = policy.backoff(2).as_millis();
        let third = policy.backoff(3).as_millis();
        assert!((375..=625).contains(&first), "first delay {}", first);
        assert!((750..=1250).contains(&second), "second delay {}", second);
        assert!((1500..=2500).contains(&third), "third delay {}", third);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RetryPolicy::is_retryable(&RelayError::Timeout("t".into())));
        assert!(RetryPolicy::is_retryable(&RelayError::Upstream(
            StatusCode::SERVICE_UNAVAILABLE,
            String::new()
        )));
        assert!(!RetryPolicy::is_retryable(&RelayError::Upstream(
            StatusCode::NOT_FOUND,
            String::new()
        )));
        assert!(!RetryPolicy::is_retryable(&RelayError::UpstreamReported(
            "bad model".into()
        )));
    }

    #[test]
    fn test_backoff_with_huge_base_delay() {
        let policy = RetryPolicy::new(3, u64::MAX);
        let delay = policy.backoff(3);
        assert!(delay.as_millis() >= (i64::MAX as u128) / 4 * 3);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        assert_eq!(RetryPolicy::new(0, 1).max_attempts, 1);
        assert_eq!(RetryPolicy::with_retries(2, 1).max_attempts, 3);
    }
}
