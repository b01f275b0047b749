//! Admission and rate control primitives.
//!
//! Two independent gates compose beneath the scheduler's concurrency bound:
//! the [`RateLimiter`] paces and bounds short-lived HTTP operations across
//! the whole engine, and the [`BandwidthManager`] shapes the byte rate of
//! each streaming transfer through per-transfer [`BandwidthThrottle`]
//! instances. Neither layer knows about the other; a transfer can be blocked
//! on admission, then separately on token availability.

mod bandwidth;
mod rate_limiter;
mod throttle;

pub use bandwidth::BandwidthManager;
pub use rate_limiter::{LimitError, RateLimitPermit, RateLimiter};
pub use throttle::BandwidthThrottle;
