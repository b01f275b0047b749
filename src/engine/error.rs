//! Error types for transfer execution.
//!
//! Every failure an executor can produce is classified here, and the
//! scheduler's retry decisions key off [`TransferError::is_retryable`]
//! alone. The variants carry enough context (URL, path, sizes) for the
//! stored last-error message to be actionable on its own.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::limit::LimitError;
use crate::task::{StoreError, TaskStatus};

/// Errors produced by the scheduler and its control surface.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid concurrency value provided.
    #[error("invalid concurrency value {value}: must be between 1 and 100")]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// A configuration field the engine cannot run with.
    #[error("invalid engine configuration: {reason}")]
    InvalidConfig {
        /// Which constraint was violated.
        reason: &'static str,
    },

    /// An enqueued URL cannot be parsed or uses an unsupported scheme.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending URL string.
        url: String,
    },

    /// Task persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The requested control operation does not apply to the task's current
    /// status (for example, resuming a task that is not paused).
    #[error("task {id} is {status}; operation requires a {required} task")]
    InvalidTaskState {
        /// The task the operation targeted.
        id: i64,
        /// Its current status.
        status: TaskStatus,
        /// The status (or status family) the operation needs.
        required: &'static str,
    },

    /// The scheduler loop has exited; no further commands can be served.
    #[error("scheduler is shut down")]
    SchedulerStopped,
}

/// Errors that can occur while executing a transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network-level failure (DNS, connection refused, TLS, mid-stream
    /// disconnect). Retryable.
    #[error("network error transferring {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// An HTTP operation timed out. Retryable.
    #[error("timeout transferring {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The server answered 5xx. Retryable.
    #[error("HTTP {status} from {url}")]
    ServerError {
        /// The URL that returned the status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The server is throttling us (429 or 503). Retryable, honoring the
    /// Retry-After header when one was supplied.
    #[error("rate limited (HTTP {status}) by {url}")]
    RateLimited {
        /// The URL that returned the status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Raw Retry-After header value, if present.
        retry_after: Option<String>,
    },

    /// The server answered with a non-retryable 4xx. Terminal.
    #[error("HTTP {status} from {url}")]
    ClientError {
        /// The URL that returned the status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The completed file does not match the size the server declared.
    /// Terminal at the byte-resume level; the next attempt restarts from
    /// byte zero.
    #[error("integrity check failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}")]
    Integrity {
        /// Destination path that failed verification.
        path: PathBuf,
        /// Expected size in bytes.
        expected_bytes: u64,
        /// Actual size in bytes.
        actual_bytes: u64,
    },

    /// Local filesystem failure while writing the destination. Terminal.
    #[error("IO error writing {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The task's URL cannot be parsed or uses an unsupported scheme.
    /// Terminal.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending URL string.
        url: String,
    },

    /// The transfer was stopped through its cancellation token. Never
    /// counted against the retry budget.
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Classifies a non-success HTTP status into the right variant.
    ///
    /// 429 and 503 become [`RateLimited`](Self::RateLimited) carrying the
    /// raw Retry-After header; other 5xx become
    /// [`ServerError`](Self::ServerError); everything else is terminal
    /// [`ClientError`](Self::ClientError).
    pub fn from_status(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        let url = url.into();
        match status {
            429 | 503 => Self::RateLimited {
                url,
                status,
                retry_after,
            },
            500..=599 => Self::ServerError { url, status },
            _ => Self::ClientError { url, status },
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an integrity mismatch error.
    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Whether the scheduler may retry after this error, subject to the
    /// retry budget.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. } => true,
            Self::ClientError { .. }
            | Self::Integrity { .. }
            | Self::Io { .. }
            | Self::InvalidUrl { .. }
            | Self::Cancelled => false,
        }
    }

    /// Whether this is a cancellation rather than a genuine failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The raw Retry-After header carried by a rate-limit error.
    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            Self::RateLimited { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}

// No From<reqwest::Error> or From<std::io::Error> impls: the variants need
// context (url, path) the source errors cannot supply, so the helper
// constructors are the conversion points.

/// Maximum Retry-After value (1 hour); longer server delays are capped.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Parses a Retry-After header value into a duration.
///
/// Supports both RFC 7231 forms: integer seconds (`120`) and HTTP-date
/// (`Wed, 21 Oct 2026 07:28:00 GMT`). Unparseable or negative values yield
/// `None`; dates in the past yield zero; anything above one hour is capped.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use downlink::engine::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("-5"), None);
/// assert_eq!(parse_retry_after("not a delay"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(duration.min(MAX_RETRY_AFTER));
    }

    if let Ok(date) = httpdate::parse_http_date(header_value) {
        let delay = date
            .duration_since(std::time::SystemTime::now())
            .unwrap_or(Duration::ZERO);
        return Some(delay.min(MAX_RETRY_AFTER));
    }

    None
}

impl From<LimitError> for TransferError {
    /// A limiter reset aborts the transfer without counting against the
    /// retry budget, exactly like an external cancellation.
    fn from(_: LimitError) -> Self {
        Self::Cancelled
    }
}
