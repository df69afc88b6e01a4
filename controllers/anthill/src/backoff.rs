//! # Exponential Backoff
//!
//! Provides a doubling backoff for retries of failed work items and of
//! conflicting status writes.
//!
//! The queue uses the stateless form keyed by failure count, starting at 5ms
//! and capped at 1000s. Status retries use the stateful form.

use std::time::Duration;

/// Base delay of the work queue rate limiter
pub const QUEUE_BASE_DELAY: Duration = Duration::from_millis(5);
/// Maximum delay of the work queue rate limiter
pub const QUEUE_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff calculator
///
/// Each backoff is twice the previous one, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay returned by the next call
    current: Duration,
    /// Maximum delay
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new backoff starting at `base` and capped at `max`
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            current: base,
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        result
    }

    /// Calculate the backoff for a given failure count (stateless)
    ///
    /// `failures` is 0 for the first retry, so the result is
    /// `base * 2^failures`, capped at `max`.
    #[must_use]
    pub fn calculate_for_failure_count(failures: u32, base: Duration, max: Duration) -> Duration {
        // 2^31 already overflows any sane base; saturate early
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        std::cmp::min(base.saturating_mul(factor), max)
    }
}
