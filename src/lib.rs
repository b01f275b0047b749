//! Downlink Core Library
//!
//! This library provides a priority- and network-aware download engine:
//! resumable HTTP transfers with durable progress checkpoints, scheduled
//! and prioritized dispatch, per-host request pacing, and fair-share
//! bandwidth throttling.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`db`] - Database connection and schema management
//! - [`task`] - Persisted task records and the storage seam
//! - [`engine`] - Transfer execution and the dispatch scheduler
//! - [`limit`] - Request-rate and bandwidth limiting
//! - [`connectivity`] - Network availability tracking for dispatch gating
//!
//! # Quick start
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use downlink::connectivity::ConnectivityMonitor;
//! use downlink::engine::{DownloadScheduler, NullSink};
//! use downlink::limit::{BandwidthManager, RateLimiter};
//! use downlink::{Database, EngineConfig, NewTask, SqliteTaskStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("downloads.db")).await?;
//! let handle = DownloadScheduler::start(
//!     Arc::new(SqliteTaskStore::new(&db)),
//!     Arc::new(RateLimiter::new(4, Duration::from_millis(250))),
//!     Arc::new(BandwidthManager::new(4 * 1024 * 1024)),
//!     ConnectivityMonitor::default(),
//!     Arc::new(NullSink),
//!     EngineConfig::default(),
//! )
//! .await?;
//!
//! handle
//!     .enqueue(NewTask::new(
//!         "https://example.com/dataset.tar.gz",
//!         "/data/dataset.tar.gz",
//!         "dataset.tar.gz",
//!     ))
//!     .await?;
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod limit;
pub mod task;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::{
    DEFAULT_CHECKPOINT_BYTES, DEFAULT_CONCURRENCY, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_RETRIES,
    DEFAULT_READ_TIMEOUT, EngineConfig,
};
pub use connectivity::{ConnectivityMonitor, ConnectivitySnapshot, NetworkKind};
pub use db::{Database, DbError};
pub use engine::{
    DownloadScheduler, EngineError, ProgressSink, ProgressSnapshot, SchedulerHandle,
    TransferError, TransferEvent,
};
pub use limit::{BandwidthManager, BandwidthThrottle, LimitError, RateLimiter};
pub use task::{
    NetworkRequirement, NewTask, SqliteTaskStore, StoreError, Task, TaskPriority, TaskStatus,
    TaskStore,
};
