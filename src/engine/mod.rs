//! The download engine: transfer execution and scheduling.
//!
//! # Overview
//!
//! Two layers live here. [`TransferExecutor`] moves the bytes of a single
//! task: it negotiates HTTP range resumption, streams chunks through the
//! bandwidth throttle, checkpoints progress to the store, and validates the
//! final size. [`DownloadScheduler`] sits above it, owning the pending
//! queue and deciding which tasks run when, bounded by concurrency,
//! priority, schedule times, retry backoff, and network requirements.
//!
//! Applications talk to the engine through a [`SchedulerHandle`] and
//! observe transfers through a [`ProgressSink`].

mod error;
mod executor;
mod progress;
mod queue;
mod retry;
mod scheduler;
mod transport;

pub use error::{EngineError, TransferError, parse_retry_after};
pub use executor::{TransferExecutor, TransferOutcome};
pub use progress::{EventChannelSink, NullSink, ProgressSink, ProgressSnapshot, TransferEvent};
pub use retry::BackoffPolicy;
pub use scheduler::{DownloadScheduler, SchedulerHandle};
pub use transport::{HeadInfo, HttpTransport};
