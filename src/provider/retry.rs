//! Retry with exponential backoff for transient provider errors.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::ProviderError;

/// Exponential backoff policy for retryable provider errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap for a single delay.
    pub max_delay: Duration,
    /// Jitter factor (0.0 - 1.0) added on top of each delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries without sleeping.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Returns the delay before retry number `retry` (1-based).
    ///
    /// A provider hint raises the delay but never lowers it.
    #[must_use]
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let base = self.initial_delay.saturating_mul(factor).min(self.max_delay);
        let delay = jittered_delay(base, self.jitter).min(self.max_delay.max(base));
        hint.map_or(delay, |h| delay.max(h))
    }

    /// Runs `operation` until it succeeds, fails permanently, or the attempt
    /// budget is spent.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, or the last retryable one once
    /// attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1u32;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = %label, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.retryable && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt, e.retry_after_ms.map(Duration::from_millis));
                    warn!(
                        operation = %label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn jittered_delay(base: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || base.is_zero() {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0.0..jitter_factor);
    Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(400));
        assert_eq!(policy.delay_for(8, None), Duration::from_millis(1000));
    }

    #[test]
    fn test_hint_raises_delay() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: 0.0,
        };
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_millis(750))),
            Duration::from_millis(750)
        );
        assert_eq!(
            policy.delay_for(3, Some(Duration::from_millis(10))),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(150),
            jitter: 0.5,
        };
        for retry in 1..5 {
            assert!(policy.delay_for(retry, None) <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = RetryPolicy::immediate(3)
            .run("create", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProviderError::transient("unavailable", "try again"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = RetryPolicy::immediate(3)
            .run("create", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::throttled("slow down", None))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = RetryPolicy::immediate(5)
            .run("delete", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::fatal("rejected", "bad request"))
            })
            .await;

        assert_eq!(result.unwrap_err().code, "rejected");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
