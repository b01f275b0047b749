//! Concurrency and pacing control for outbound HTTP operations.
//!
//! This module provides the [`RateLimiter`] struct which bounds how many
//! HTTP operations may be in flight at once and enforces a minimum delay
//! between operation starts, so bursts of small requests do not hammer the
//! origin server.
//!
//! # Overview
//!
//! `acquire()` suspends until a concurrency slot is free *and* the pacing
//! delay since the previous release has elapsed, then returns a
//! [`RateLimitPermit`]. The slot is freed when the permit is dropped, so an
//! early return or error can never leak a slot. Waiters are served in strict
//! arrival order; priority is the scheduler's concern, not this layer's.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use downlink::limit::RateLimiter;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = Arc::new(RateLimiter::new(3, Duration::from_millis(100)));
//!
//! let permit = limiter.acquire().await?;
//! // ... perform the HTTP operation ...
//! drop(permit);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Errors produced by rate limiter operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LimitError {
    /// The limiter was reset while this caller was waiting for a permit.
    #[error("rate limiter was reset while waiting for a permit")]
    LimiterReset,
}

type WaiterSlot = oneshot::Sender<Result<RateLimitPermit, LimitError>>;

/// Mutable limiter state. All fields change together under one lock.
#[derive(Debug)]
struct LimiterState {
    /// Number of permits currently outstanding.
    active: usize,
    /// When the most recent permit was released; `None` before any release.
    last_release: Option<Instant>,
    /// Callers waiting for a slot, in arrival order.
    waiters: VecDeque<WaiterSlot>,
}

#[derive(Debug)]
struct LimiterInner {
    max_concurrent: usize,
    min_delay: Duration,
    state: Mutex<LimiterState>,
}

impl LimiterInner {
    fn locked(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Frees one slot: hands it to the longest-waiting caller if any,
    /// otherwise decrements the active count.
    fn release(inner: &Arc<Self>) {
        let mut state = inner.locked();
        state.last_release = Some(Instant::now());

        loop {
            let Some(waiter) = state.waiters.pop_front() else {
                state.active = state.active.saturating_sub(1);
                return;
            };
            let permit = RateLimitPermit {
                inner: Arc::clone(inner),
                armed: true,
            };
            match waiter.send(Ok(permit)) {
                // The slot now belongs to the woken waiter.
                Ok(()) => return,
                // The waiter gave up before being served; keep the slot and
                // try the next one. The unclaimed permit must not release
                // again on drop.
                Err(rejected) => {
                    if let Ok(mut unclaimed) = rejected {
                        unclaimed.armed = false;
                    }
                }
            }
        }
    }
}

/// Bounds concurrent HTTP operations and paces their starts.
///
/// Designed to be wrapped in `Arc` and passed explicitly to every component
/// that performs HTTP work; there is no process-global instance, so tests
/// and independent engine instances cannot interfere with each other.
#[derive(Debug)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    /// Creates a limiter allowing `max_concurrent` simultaneous operations
    /// with at least `min_delay` between one release and the next start.
    ///
    /// A `max_concurrent` of zero is treated as one: a limiter that can
    /// never grant a permit would deadlock every caller.
    #[must_use]
    #[instrument(skip_all, fields(max_concurrent, delay_ms = min_delay.as_millis()))]
    pub fn new(max_concurrent: usize, min_delay: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            inner: Arc::new(LimiterInner {
                max_concurrent: max_concurrent.max(1),
                min_delay,
                state: Mutex::new(LimiterState {
                    active: 0,
                    last_release: None,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Returns the configured concurrency bound.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Returns the configured pacing delay.
    #[must_use]
    pub fn min_delay(&self) -> Duration {
        self.inner.min_delay
    }

    /// Returns the number of permits currently outstanding.
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.locked().active
    }

    /// Returns the number of callers waiting for a permit.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.inner.locked().waiters.len()
    }

    /// Waits for a free slot and the pacing delay, then returns a permit.
    ///
    /// Waiters are served strictly in arrival order. The permit frees its
    /// slot on drop.
    ///
    /// # Errors
    ///
    /// Returns [`LimitError::LimiterReset`] if [`reset`](Self::reset) is
    /// called while this caller is queued.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<RateLimitPermit, LimitError> {
        let waiter = {
            let mut state = self.inner.locked();
            if state.waiters.is_empty() && state.active < self.inner.max_concurrent {
                state.active += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        let permit = match waiter {
            None => RateLimitPermit {
                inner: Arc::clone(&self.inner),
                armed: true,
            },
            Some(rx) => {
                debug!("waiting for rate limit slot");
                match rx.await {
                    Ok(outcome) => outcome?,
                    // Sender dropped without a payload; only reset does that.
                    Err(_) => return Err(LimitError::LimiterReset),
                }
            }
        };

        self.pace().await;
        Ok(permit)
    }

    /// Runs `operation` under a permit, releasing the slot whatever the
    /// operation's outcome.
    ///
    /// # Errors
    ///
    /// Returns [`LimitError::LimiterReset`] if the limiter is reset while
    /// waiting for admission. The operation's own result is passed through
    /// untouched.
    pub async fn execute<F, T>(&self, operation: F) -> Result<T, LimitError>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        Ok(operation.await)
    }

    /// Fails every queued waiter and zeroes the limiter state.
    ///
    /// Intended for tests and emergency shutdown, not normal flow control.
    /// Permits already handed out remain valid; their eventual release is
    /// absorbed harmlessly.
    #[instrument(skip(self))]
    pub fn reset(&self) {
        let mut state = self.inner.locked();
        let failed = state.waiters.len();
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(Err(LimitError::LimiterReset));
        }
        state.active = 0;
        state.last_release = None;
        if failed > 0 {
            warn!(failed_waiters = failed, "rate limiter reset with queued waiters");
        }
    }

    /// Sleeps until `min_delay` has elapsed since the most recent release.
    ///
    /// Re-checks after waking: another permit may have been released while
    /// this caller slept, pushing the pacing window forward.
    async fn pace(&self) {
        loop {
            let remaining = {
                let state = self.inner.locked();
                state
                    .last_release
                    .and_then(|last| self.inner.min_delay.checked_sub(last.elapsed()))
            };
            match remaining {
                Some(wait) if !wait.is_zero() => {
                    debug!(wait_ms = wait.as_millis(), "pacing before operation start");
                    tokio::time::sleep(wait).await;
                }
                _ => return,
            }
        }
    }
}

/// Permission to perform one rate-limited operation.
///
/// Dropping the permit releases the concurrency slot and, if anyone is
/// queued, wakes the longest-waiting caller.
#[derive(Debug)]
#[must_use]
pub struct RateLimitPermit {
    inner: Arc<LimiterInner>,
    armed: bool,
}

impl Drop for RateLimitPermit {
    fn drop(&mut self) {
        if self.armed {
            LimiterInner::release(&self.inner);
        }
    }
}
