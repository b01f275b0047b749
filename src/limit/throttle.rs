//! Token-bucket byte-rate shaping for a single transfer.
//!
//! # Overview
//!
//! A [`BandwidthThrottle`] accrues tokens continuously at its configured
//! rate, capped at a burst ceiling of twice the rate. Before writing each
//! streamed chunk the executor calls [`consume`](BandwidthThrottle::consume)
//! with the chunk size; the call returns immediately while tokens last and
//! otherwise sleeps just long enough for the deficit to accrue. Short bursts
//! up to the ceiling are allowed by design, which keeps small transfers
//! snappy without breaking the long-run average rate.
//!
//! # Example
//!
//! ```no_run
//! use downlink::limit::BandwidthThrottle;
//!
//! # async fn example() {
//! // Shape a stream to 512 KiB/s.
//! let throttle = BandwidthThrottle::new(512 * 1024);
//! throttle.consume(16 * 1024).await;
//! // ... write the chunk ...
//! # }
//! ```

use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct ThrottleState {
    /// Accrual rate in bytes per second. Zero disables shaping.
    rate: f64,
    /// Token ceiling, fixed at twice the rate.
    burst: f64,
    /// Currently available tokens, always within `[0, burst]`.
    tokens: f64,
    /// When tokens were last accrued.
    last_refill: Instant,
    paused: bool,
}

impl ThrottleState {
    /// Accrues tokens for the time elapsed since the last refill. No tokens
    /// accrue while paused.
    fn refill(&mut self) {
        let now = Instant::now();
        if !self.paused {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        }
        self.last_refill = now;
    }
}

/// Outcome of a single admission check under the state lock.
enum Admission {
    Granted,
    Paused,
    Wait(Duration),
}

/// Token-bucket rate shaper for one transfer's byte stream.
///
/// Shared between the executor and the [`BandwidthManager`] behind an `Arc`;
/// the manager adjusts the rate in place as transfers come and go.
///
/// [`BandwidthManager`]: crate::limit::BandwidthManager
#[derive(Debug)]
pub struct BandwidthThrottle {
    state: Mutex<ThrottleState>,
    resumed: Notify,
}

impl BandwidthThrottle {
    /// Creates a throttle accruing `bytes_per_second` tokens with a burst
    /// ceiling of twice that. The bucket starts full.
    ///
    /// A rate of zero disables shaping: `consume` never delays.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(bytes_per_second: u64) -> Self {
        let rate = bytes_per_second as f64;
        let burst = rate * 2.0;
        Self {
            state: Mutex::new(ThrottleState {
                rate,
                burst,
                tokens: burst,
                last_refill: Instant::now(),
                paused: false,
            }),
            resumed: Notify::new(),
        }
    }

    /// Creates a throttle that never delays.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    fn locked(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current rate in bytes per second.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn rate(&self) -> u64 {
        self.locked().rate as u64
    }

    /// Returns whether accrual is currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.locked().paused
    }

    /// Consumes `bytes` tokens, sleeping until enough have accrued.
    ///
    /// If the tokens are already available the call returns without
    /// delaying. Otherwise it sleeps for `(bytes - available) / rate` and
    /// then deducts, clamping the balance at zero. While the throttle is
    /// paused the call waits for [`resume`](Self::resume) even if tokens
    /// are available.
    #[allow(clippy::cast_precision_loss)]
    pub async fn consume(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let needed = bytes as f64;

        loop {
            // Register interest in resume notifications before checking the
            // paused flag, so a resume between the check and the await is
            // not lost.
            let mut resumed = pin!(self.resumed.notified());
            resumed.as_mut().enable();

            let admission = {
                let mut state = self.locked();
                state.refill();
                if state.paused {
                    Admission::Paused
                } else if state.rate <= 0.0 {
                    Admission::Granted
                } else if state.tokens >= needed {
                    state.tokens -= needed;
                    Admission::Granted
                } else {
                    let deficit = needed - state.tokens;
                    Admission::Wait(Duration::from_secs_f64(deficit / state.rate))
                }
            };

            match admission {
                Admission::Granted => return,
                Admission::Paused => {
                    debug!("throttle paused; waiting for resume");
                    resumed.await;
                }
                Admission::Wait(wait) => {
                    tokio::time::sleep(wait).await;
                    let mut state = self.locked();
                    if !state.paused {
                        state.refill();
                        state.tokens = (state.tokens - needed).max(0.0);
                        return;
                    }
                    // Paused while sleeping; go around and wait for resume.
                }
            }
        }
    }

    /// Stops token accrual. Balance already accrued is kept.
    pub fn pause(&self) {
        let mut state = self.locked();
        state.refill();
        state.paused = true;
    }

    /// Restarts token accrual from now.
    ///
    /// The refill clock restarts at the resume instant, so time spent
    /// paused grants no tokens.
    pub fn resume(&self) {
        {
            let mut state = self.locked();
            if !state.paused {
                return;
            }
            state.paused = false;
            state.last_refill = Instant::now();
        }
        self.resumed.notify_waiters();
    }

    /// Changes the rate in place, settling accrual at the old rate first.
    ///
    /// The burst ceiling follows the new rate and the token balance is
    /// clamped to it.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_rate(&self, bytes_per_second: u64) {
        let mut state = self.locked();
        state.refill();
        state.rate = bytes_per_second as f64;
        state.burst = state.rate * 2.0;
        state.tokens = state.tokens.clamp(0.0, state.burst);
    }
}
