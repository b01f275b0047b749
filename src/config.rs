//! Engine configuration (concurrency, retry budget, timeouts).

use std::time::Duration;

/// Minimum allowed concurrency value.
pub(crate) const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
pub(crate) const MAX_CONCURRENCY: usize = 100;

/// Default number of simultaneously running transfers.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Default retry budget per task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default HTTP connect timeout (30 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default HTTP read timeout (60 seconds, applied per read so large
/// transfers are not cut off by a whole-request deadline).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Default progress-checkpoint interval (1 MiB).
pub const DEFAULT_CHECKPOINT_BYTES: u64 = 1024 * 1024;

/// Tunables for the scheduler and its executors.
///
/// All fields have sensible defaults; construct with struct-update syntax
/// to override a few:
///
/// ```
/// use std::time::Duration;
/// use downlink::EngineConfig;
///
/// let config = EngineConfig {
///     max_concurrent_downloads: 2,
///     tick_interval: Duration::from_millis(250),
///     ..EngineConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of transfers running at once (1-100).
    pub max_concurrent_downloads: usize,
    /// How many times a task may be retried after transient failures
    /// before it becomes terminally failed.
    pub max_retry_attempts: u32,
    /// Period of the dispatch timer that re-examines schedule and backoff
    /// gates. Signals (enqueues, completions, connectivity changes) wake
    /// dispatch immediately regardless of this interval.
    pub tick_interval: Duration,
    /// Base delay of the exponential retry backoff.
    pub backoff_base: Duration,
    /// Upper bound on the retry backoff delay.
    pub backoff_cap: Duration,
    /// How many bytes may accumulate between durable progress checkpoints.
    /// A crash loses at most this much transfer progress.
    pub checkpoint_bytes: u64,
    /// HTTP connect timeout.
    pub connect_timeout: Duration,
    /// HTTP per-read timeout.
    pub read_timeout: Duration,
    /// Whether a failed transfer's partial file is removed from disk.
    /// Defaults to false so retries and manual resumes can reuse the
    /// partial bytes.
    pub delete_on_error: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_CONCURRENCY,
            max_retry_attempts: DEFAULT_MAX_RETRIES,
            tick_interval: Duration::from_secs(1),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(64),
            checkpoint_bytes: DEFAULT_CHECKPOINT_BYTES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            delete_on_error: false,
        }
    }
}

impl EngineConfig {
    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] if the concurrency limit
    /// is outside 1-100, or [`EngineError::InvalidConfig`] for a zero tick
    /// interval.
    ///
    /// [`EngineError::InvalidConcurrency`]: crate::engine::EngineError::InvalidConcurrency
    /// [`EngineError::InvalidConfig`]: crate::engine::EngineError::InvalidConfig
    pub fn validate(&self) -> Result<(), crate::engine::EngineError> {
        use crate::engine::EngineError;

        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.max_concurrent_downloads) {
            return Err(EngineError::InvalidConcurrency {
                value: self.max_concurrent_downloads,
            });
        }
        if self.tick_interval.is_zero() {
            return Err(EngineError::InvalidConfig {
                reason: "tick interval must be nonzero",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_downloads, 3);
        assert_eq!(config.max_retry_attempts, 3);
        assert!(!config.delete_on_error);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = EngineConfig {
            max_concurrent_downloads: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConcurrency { value: 0 })
        ));
    }

    #[test]
    fn test_excessive_concurrency_rejected() {
        let config = EngineConfig {
            max_concurrent_downloads: 101,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConcurrency { value: 101 })
        ));
    }

    #[test]
    fn test_boundary_concurrency_accepted() {
        for value in [1, 100] {
            let config = EngineConfig {
                max_concurrent_downloads: value,
                ..EngineConfig::default()
            };
            assert!(config.validate().is_ok(), "concurrency {value}");
        }
    }

    #[test]
    fn test_zero_tick_interval_rejected() {
        let config = EngineConfig {
            tick_interval: Duration::ZERO,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig { .. })
        ));
    }
}
