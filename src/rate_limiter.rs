//! Client-side admission gate for outbound batch calls
//!
//! Gmail meters requests in "quota units" per user per second:
//! - messages.list: 5 units
//! - messages.get: 5 units (each element of a batch is billed separately)
//! - messages.batchDelete: 50 units
//!
//! The batch sizes are chosen so that one listing call, one batch-get and one
//! batch delete fit under the budget together. This module enforces the other
//! half of that contract: no more than `calls` gated calls are admitted in any
//! rolling window of `period`. Admission times are kept in a sliding log, so
//! the bound holds for every window, not just aligned ones.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Gmail API quota costs for the operations the cleanup issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCost {
    /// messages.list
    List,
    /// messages.get, per message
    Get,
    /// messages.batchDelete
    BatchDelete,
}

impl QuotaCost {
    /// Get the quota unit cost for this operation type
    pub fn units(&self) -> u32 {
        match self {
            QuotaCost::List => 5,
            QuotaCost::Get => 5,
            QuotaCost::BatchDelete => 50,
        }
    }
}

/// Worst-case quota units spent inside one limiter window
pub fn window_cost(calls_per_window: u32, batch_get_size: usize) -> u64 {
    let gated = QuotaCost::List.units() as u64 + batch_get_size as u64 * QuotaCost::Get.units() as u64;
    calls_per_window as u64 * gated + QuotaCost::BatchDelete.units() as u64
}

/// Returned by [`RateLimiter::try_acquire`] when the window is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttled {
    /// Time until the oldest admission leaves the window
    pub retry_after: Duration,
}

/// Sliding-window rate limiter shared by every caller
///
/// Clones share the same admission log, so a single gate can be handed to
/// several workers.
#[derive(Debug)]
pub struct RateLimiter {
    inner: Arc<Mutex<RateLimiterState>>,
}

#[derive(Debug)]
struct RateLimiterState {
    /// Admission times still inside the window, oldest first
    admitted: VecDeque<Instant>,
    /// Maximum admissions per window
    calls: u32,
    /// Window length
    period: Duration,
    /// Total admissions (for stats)
    total_admitted: u64,
    /// Total rejections (for stats)
    total_throttled: u64,
}

impl RateLimiterState {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if now.duration_since(oldest) >= self.period {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_admit(&mut self) -> Result<RatePermit, Throttled> {
        let now = Instant::now();
        self.prune(now);

        trace!(
            "Limiter state: {}/{} admissions in window",
            self.admitted.len(),
            self.calls
        );

        if self.admitted.len() < self.calls as usize {
            self.admitted.push_back(now);
            self.total_admitted += 1;
            return Ok(RatePermit { _private: () });
        }

        self.total_throttled += 1;
        let retry_after = self
            .admitted
            .front()
            .map(|&oldest| (oldest + self.period).saturating_duration_since(now))
            .unwrap_or(self.period);
        Err(Throttled { retry_after })
    }
}

impl RateLimiter {
    /// `calls` admissions per second
    pub fn per_second(calls: u32) -> Self {
        Self::with_config(calls, Duration::from_secs(1))
    }

    /// Create a limiter with custom configuration
    ///
    /// # Arguments
    /// * `calls` - Maximum admissions per window (at least 1)
    /// * `period` - Window length
    pub fn with_config(calls: u32, period: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RateLimiterState {
                admitted: VecDeque::with_capacity(calls as usize),
                calls: calls.max(1),
                period,
                total_admitted: 0,
                total_throttled: 0,
            })),
        }
    }

    /// Admit a call if the window has room, without waiting
    pub async fn try_acquire(&self) -> Result<RatePermit, Throttled> {
        self.inner.lock().await.try_admit()
    }

    /// Admit a call, waiting for the window to open if necessary
    pub async fn acquire(&self) -> RatePermit {
        loop {
            let wait_time = match self.inner.lock().await.try_admit() {
                Ok(permit) => return permit,
                Err(throttled) => throttled.retry_after,
            };

            // Sleep outside the lock so other callers can observe the window
            debug!("Limiter window full, waiting {:.2}s", wait_time.as_secs_f64());
            tokio::time::sleep(wait_time).await;
        }
    }

    /// Get current statistics about admissions
    pub async fn stats(&self) -> LimiterStats {
        let mut state = self.inner.lock().await;
        state.prune(Instant::now());
        LimiterStats {
            in_window: state.admitted.len() as u32,
            calls_per_window: state.calls,
            total_admitted: state.total_admitted,
            total_throttled: state.total_throttled,
        }
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Marker for an admitted call
#[derive(Debug)]
pub struct RatePermit {
    _private: (),
}

/// Statistics about limiter usage
#[derive(Debug, Clone)]
pub struct LimiterStats {
    /// Admissions currently inside the window
    pub in_window: u32,
    /// Configured maximum per window
    pub calls_per_window: u32,
    /// Total admissions since creation
    pub total_admitted: u64,
    /// Total rejections since creation
    pub total_throttled: u64,
}
