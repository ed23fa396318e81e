//! Bounded exponential backoff for transient action failures
//!
//! The scheduler records each transient failure and pushes the next attempt
//! out by `base_delay * multiplier^attempt`, capped at `max_delay`. Once
//! `max_retries` failures are recorded the maintainer forces the operation to
//! FAILED.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Transient failures tolerated before the operation is failed
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub const DEFAULT: Self = Self {
        max_retries: 5,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
        multiplier: 2.0,
    };

    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// True once `retry_count` recorded failures use up the budget
    pub fn is_exhausted(&self, retry_count: i32) -> bool {
        i64::from(retry_count) >= i64::from(self.max_retries)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}
