//! Progress reporting for active transfers.
//!
//! Executors publish [`ProgressSnapshot`] values through a [`ProgressSink`].
//! Snapshots are immutable copies of the transfer state at one instant, so
//! consumers on other tasks or threads never observe a torn update. Sink
//! callbacks are fire-and-forget: a slow or broken consumer must never be
//! able to stall a transfer.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Window over which instantaneous transfer speed is averaged.
const SPEED_WINDOW: Duration = Duration::from_millis(500);

/// A point-in-time view of one transfer's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Task this snapshot belongs to.
    pub task_id: i64,
    /// Display name of the file being transferred.
    pub file_name: String,
    /// Bytes written to disk so far, including any resumed prefix.
    pub downloaded_bytes: u64,
    /// Expected final size, when the server declared one.
    pub total_bytes: Option<u64>,
    /// Instantaneous transfer speed in bytes per second.
    pub bytes_per_second: u64,
    /// Estimated time remaining. `None` until the size and a nonzero speed
    /// are both known.
    pub eta: Option<Duration>,
    /// Completed fraction in `0.0..=1.0`, when the total size is known.
    pub fraction: Option<f64>,
}

/// Accumulates per-chunk byte counts into speed and ETA estimates.
///
/// Speed is averaged over a short rolling window rather than the whole
/// transfer, so the number tracks current network conditions instead of
/// being dragged by a slow start.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    task_id: i64,
    file_name: String,
    total_bytes: Option<u64>,
    downloaded_bytes: u64,
    window_started: Instant,
    window_bytes: u64,
    bytes_per_second: u64,
}

impl ProgressTracker {
    pub(crate) fn new(
        task_id: i64,
        file_name: impl Into<String>,
        starting_bytes: u64,
        total_bytes: Option<u64>,
    ) -> Self {
        Self {
            task_id,
            file_name: file_name.into(),
            total_bytes,
            downloaded_bytes: starting_bytes,
            window_started: Instant::now(),
            window_bytes: 0,
            bytes_per_second: 0,
        }
    }

    /// Records a received chunk and returns the updated snapshot.
    pub(crate) fn record(&mut self, bytes: u64) -> ProgressSnapshot {
        self.downloaded_bytes = self.downloaded_bytes.saturating_add(bytes);
        self.window_bytes = self.window_bytes.saturating_add(bytes);

        let elapsed = self.window_started.elapsed();
        if elapsed >= SPEED_WINDOW {
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                self.bytes_per_second = (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
            }
            self.window_started = Instant::now();
            self.window_bytes = 0;
        }

        self.snapshot()
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn snapshot(&self) -> ProgressSnapshot {
        let remaining = self
            .total_bytes
            .and_then(|total| total.checked_sub(self.downloaded_bytes));
        let eta = match (remaining, self.bytes_per_second) {
            (Some(remaining), speed) if speed > 0 => {
                Some(Duration::from_secs_f64(remaining as f64 / speed as f64))
            }
            _ => None,
        };
        let fraction = self
            .total_bytes
            .filter(|total| *total > 0)
            .map(|total| self.downloaded_bytes as f64 / total as f64);

        ProgressSnapshot {
            task_id: self.task_id,
            file_name: self.file_name.clone(),
            downloaded_bytes: self.downloaded_bytes,
            total_bytes: self.total_bytes,
            bytes_per_second: self.bytes_per_second,
            eta,
            fraction,
        }
    }
}

/// Receiver of transfer lifecycle notifications.
///
/// Implementations must be cheap and must not block: callbacks run on the
/// executor's task between chunk writes. All methods default to no-ops so
/// a sink only implements the events it cares about.
pub trait ProgressSink: Send + Sync {
    /// Called after each chunk is written to disk.
    fn on_progress(&self, _snapshot: &ProgressSnapshot) {}

    /// Called once when a transfer finishes successfully.
    fn on_complete(&self, _task_id: i64) {}

    /// Called once when a transfer fails terminally (retry budget exhausted
    /// or a non-retryable error).
    fn on_error(&self, _task_id: i64, _message: &str) {}
}

/// Sink that discards all notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {}

/// A transfer lifecycle notification delivered by [`EventChannelSink`].
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A chunk was written; carries the current snapshot.
    Progress(ProgressSnapshot),
    /// The transfer completed successfully.
    Completed {
        /// Task that completed.
        task_id: i64,
    },
    /// The transfer failed terminally.
    Failed {
        /// Task that failed.
        task_id: i64,
        /// Stored failure message.
        message: String,
    },
}

/// Sink that forwards notifications over an unbounded channel.
///
/// Dropping the receiver silently disables delivery; transfers are never
/// affected by the consumer going away.
#[derive(Debug, Clone)]
pub struct EventChannelSink {
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl EventChannelSink {
    /// Creates a sink and the receiver its events arrive on.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Self { events }, receiver)
    }
}

impl ProgressSink for EventChannelSink {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        let _ = self.events.send(TransferEvent::Progress(snapshot.clone()));
    }

    fn on_complete(&self, task_id: i64) {
        let _ = self.events.send(TransferEvent::Completed { task_id });
    }

    fn on_error(&self, task_id: i64, message: &str) {
        let _ = self.events.send(TransferEvent::Failed {
            task_id,
            message: message.to_string(),
        });
    }
}
