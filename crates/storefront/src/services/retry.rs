//! Bounded retry with exponential backoff for store writes.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::config::GrantConfig;

/// Upper bound on jitter added to each backoff delay.
const MAX_JITTER_MS: u64 = 50;

/// All attempts failed.
#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempts: {last_error}")]
pub struct RetryExhausted {
    pub operation: &'static str,
    pub attempts: u32,
    pub last_error: String,
}

/// How many times to try an operation, and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        GrantConfig::default().into()
    }
}

impl From<GrantConfig> for RetryPolicy {
    fn from(config: GrantConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.retry_base,
            attempt_timeout: config.attempt_timeout,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no delay. Used where the caller owns the retry loop.
    #[must_use]
    pub const fn once(attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            attempt_timeout,
        }
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// Each attempt is bounded by `attempt_timeout`; a timed-out attempt
    /// counts as a failure.
    ///
    /// # Errors
    ///
    /// Returns [`RetryExhausted`] carrying the last failure.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("timed out after {:?}", self.attempt_timeout);
                }
            }

            tracing::warn!(
                operation,
                attempt,
                max_attempts,
                error = %last_error,
                "Attempt failed"
            );

            if attempt < max_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        Err(RetryExhausted {
            operation,
            attempts: max_attempts,
            last_error,
        })
    }

    /// Delay after the given (1-based) failed attempt.
    fn backoff(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let jitter = Duration::from_millis(rand::rng().random_range(0..=MAX_JITTER_MS));
        self.base_delay.saturating_mul(factor) + jitter
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            attempt_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = policy(3)
            .run("write", || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 { Err("busy") } else { Ok(n) }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_last_error() {
        let err = policy(2)
            .run("write", || async { Err::<(), _>("disk full") })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 2);
        assert_eq!(err.last_error, "disk full");
        assert_eq!(err.operation, "write");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_attempt_counts_as_failure() {
        let policy = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            attempt_timeout: Duration::from_millis(5),
        };

        let err = policy
            .run("slow", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<(), &str>(())
            })
            .await
            .unwrap_err();

        assert!(err.last_error.contains("timed out"));
    }

    #[test]
    fn test_backoff_doubles() {
        let p = policy(5);
        let first = p.backoff(1);
        let third = p.backoff(3);
        assert!(first >= Duration::from_millis(10));
        assert!(third >= Duration::from_millis(40));
        assert!(third <= Duration::from_millis(40 + MAX_JITTER_MS));
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let p = RetryPolicy::from(GrantConfig {
            max_attempts: 0,
            ..GrantConfig::default()
        });
        assert_eq!(p.max_attempts, 1);
    }
}
