//! Exponential backoff over client-side throttling
//!
//! Only the self-imposed limiter is retried here. Remote failures are counted
//! per phase by the engine, which decides when they become fatal.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{MailboxError, Result};
use crate::rate_limiter::{RateLimiter, RatePermit};

/// Retry policy for admission through the [`RateLimiter`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_interval: Duration,
    max_interval: Duration,
}

impl RetryPolicy {
    /// # Arguments
    /// * `max_attempts` - Admission attempts before giving up (at least 1)
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
        }
    }

    pub fn with_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.max_interval = max;
        self
    }

    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(2.0)
            .with_randomization_factor(0.5)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Wait until the limiter admits one call
    ///
    /// Each rejection sleeps for the longer of the next backoff interval and
    /// the limiter's own `retry_after`.
    pub async fn admit(&self, limiter: &RateLimiter, operation: &str) -> Result<RatePermit> {
        let mut schedule = self.schedule();

        for attempt in 1..=self.max_attempts {
            match limiter.try_acquire().await {
                Ok(permit) => {
                    trace!("{} admitted on attempt {}", operation, attempt);
                    return Ok(permit);
                }
                Err(throttled) if attempt < self.max_attempts => {
                    let delay = schedule
                        .next_backoff()
                        .unwrap_or(self.max_interval)
                        .max(throttled.retry_after);
                    debug!(
                        "{} throttled (attempt {}/{}), retrying in {:?}",
                        operation, attempt, self.max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(_) => {}
            }
        }

        Err(MailboxError::ThrottleExhausted {
            operation: operation.to_string(),
            attempts: self.max_attempts,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_admit_immediately_when_window_open() {
        let limiter = RateLimiter::per_second(1);
        let policy = RetryPolicy::new(3);

        let start = Instant::now();
        policy.admit(&limiter, "list").await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_backs_off_until_window_opens() {
        let limiter = RateLimiter::per_second(1);
        let policy = RetryPolicy::new(16);

        let start = Instant::now();
        policy.admit(&limiter, "first").await.unwrap();
        policy.admit(&limiter, "second").await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(limiter.stats().await.total_admitted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_gives_up_after_max_attempts() {
        let limiter = RateLimiter::per_second(1);
        let policy = RetryPolicy::new(1);

        limiter.try_acquire().await.unwrap();
        let err = policy.admit(&limiter, "batch-get").await.unwrap_err();
        match err {
            MailboxError::ThrottleExhausted { operation, attempts } => {
                assert_eq!(operation, "batch-get");
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(limiter.stats().await.total_throttled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_waits_at_least_retry_after() {
        let limiter = RateLimiter::with_config(1, Duration::from_secs(30));
        let policy = RetryPolicy::new(4)
            .with_intervals(Duration::from_millis(10), Duration::from_millis(10));

        limiter.try_acquire().await.unwrap();
        let start = Instant::now();
        policy.admit(&limiter, "list").await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(limiter.stats().await.total_throttled, 1);
    }
}
