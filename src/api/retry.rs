// src/api/retry.rs
//! Retry with exponential backoff.
//!
//! `delay(attempt) = base * 2^attempt`, attempt counted from 0, capped at
//! `max_delay`. Backoff sleeps race the caller's cancellation token.

use log::{debug, info, warn};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total tries including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub enable_jitter: bool,
    pub jitter_percent: f64, // 0.0 - 1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            enable_jitter: false,
            jitter_percent: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// Backoff to wait after `attempt` (0-based) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u128.saturating_pow(attempt.min(32));
        let delay_ms = self
            .base_delay
            .as_millis()
            .saturating_mul(factor)
            .min(self.max_delay.as_millis());
        let mut delay = Duration::from_millis(delay_ms as u64);

        if self.enable_jitter && self.jitter_percent > 0.0 {
            let spread = delay.as_secs_f64() * self.jitter_percent.min(1.0);
            let offset = (fastrand::f64() * 2.0 - 1.0) * spread;
            delay = Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0));
        }

        debug!("Retry attempt {}: delay = {:?}", attempt, delay);
        delay
    }

    /// Whether a failure on `attempt` (0-based) should be re-issued.
    pub fn should_retry(&self, error: &ApiError, attempt: u32) -> bool {
        error.should_retry() && attempt + 1 < self.max_attempts
    }

    /// Runs `operation` until it succeeds, fails permanently or exhausts the
    /// attempt cap. The closure receives the 0-based attempt number.
    pub async fn execute<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ApiError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ApiError::Cancelled);
            }

            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        info!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(value);
                }
                Err(err) if self.should_retry(&err, attempt) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        "Attempt {}/{} failed: {} (retrying in {:?})",
                        attempt + 1,
                        self.max_attempts,
                        err,
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => {
                    if err.should_retry() {
                        warn!("All {} attempts failed, last error: {}", self.max_attempts, err);
                    } else if !err.is_cancelled() {
                        debug!("Non-retryable error on attempt {}: {}", attempt + 1, err);
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn lost() -> ApiError {
        ApiError::transport(TransportErrorKind::ConnectionLost, "reset by peer")
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(3),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(3));
    }

    #[test]
    fn jitter_stays_within_spread() {
        let policy = RetryPolicy {
            enable_jitter: true,
            jitter_percent: 0.1,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(1800) && delay <= Duration::from_millis(2200));
        }
    }

    #[test]
    fn attempt_cap_counts_first_try() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&lost(), 0));
        assert!(policy.should_retry(&lost(), 1));
        assert!(!policy.should_retry(&lost(), 2));
        assert!(!policy.should_retry(&ApiError::NotFound, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_then_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = calls.clone();
        let result = policy
            .execute(&cancel, move |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(lost())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .execute(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::Unauthorized) }
            })
            .await;

        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_backoff_sleep() {
        let policy = RetryPolicy::new(3, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<(), _> = policy.execute(&cancel, |_| async { Err(lost()) }).await;

        assert!(matches!(result, Err(ApiError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
