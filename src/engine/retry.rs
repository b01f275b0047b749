//! Exponential backoff for failed transfers.
//!
//! Retry *eligibility* is decided by [`TransferError::is_retryable`] and the
//! task's retry budget; this module only answers "how long must an eligible
//! task wait before it may start again". A server-supplied Retry-After
//! delay, when present, overrides the computed backoff for that attempt.
//!
//! [`TransferError::is_retryable`]: crate::engine::TransferError::is_retryable

use std::time::Duration;

/// Deterministic exponential backoff schedule.
///
/// The delay before attempt `n` (1-based retry count) is
/// `base * 2^n`, capped at `cap`. With the default one-second base that
/// yields 2s, 4s, 8s, ... which keeps transient-failure retries cheap while
/// backing off hard from persistently failing origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    /// Creates a policy with the given base delay and cap.
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// The gate delay after `retry_count` failures, measured from the
    /// failed attempt's start time.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        // 2^32 seconds is far past any sane cap; clamp the exponent so the
        // multiplier cannot overflow.
        let multiplier = 2u32.saturating_pow(retry_count.min(31));
        self.base.saturating_mul(multiplier).min(self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(64),
        }
    }
}
