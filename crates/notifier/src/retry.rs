//! Retry policy with exponential backoff.

use std::time::Duration;

use postbox_common::types::MAX_RETRIES;

/// Delay before the first retry; doubles for every further attempt.
pub const BASE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES.unsigned_abs(),
            base_delay: BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Wait after failed `attempt` (1-indexed) before the next one, or `None`
    /// when `attempt` was the last.
    ///
    /// `delay = base * 2^(attempt - 1)`
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let exponent = attempt.saturating_sub(1).min(31);
        Some(self.base_delay.saturating_mul(1u32 << exponent))
    }
}
