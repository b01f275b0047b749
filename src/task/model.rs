//! Task types: lifecycle status, priority, network requirement, and the
//! persisted task record itself.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle status of a task.
///
/// Transitions: `queued → downloading → {completed | error | paused |
/// cancelled}`, `error → queued` while the retry budget lasts, and
/// `paused → queued → downloading` on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dispatch.
    Queued,
    /// An executor is actively streaming bytes for this task.
    Downloading,
    /// Suspended by the user or by an unmet network requirement.
    Paused,
    /// Fully transferred and size-validated.
    Completed,
    /// Abandoned by the caller.
    Cancelled,
    /// Last attempt failed; terminal once the retry budget is exhausted.
    Error,
}

impl TaskStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "error" => Ok(Self::Error),
            _ => Err(format!("invalid task status: {s}")),
        }
    }
}

/// Dispatch priority. Ordering is `Low < Normal < High` so the scheduler can
/// compare priorities directly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Dispatched only when nothing more urgent is ready.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Dispatched ahead of normal and low tasks.
    High,
}

impl TaskPriority {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            _ => Err(format!("invalid task priority: {s}")),
        }
    }
}

/// Network condition a task requires before it may be dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkRequirement {
    /// Any online network will do.
    #[default]
    Any,
    /// Wifi only; ethernet does not qualify.
    WifiOnly,
    /// Any unmetered network (wifi or ethernet).
    Unmetered,
}

impl NetworkRequirement {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::WifiOnly => "wifi_only",
            Self::Unmetered => "unmetered",
        }
    }
}

impl fmt::Display for NetworkRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for NetworkRequirement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(Self::Any),
            "wifi_only" => Ok(Self::WifiOnly),
            "unmetered" => Ok(Self::Unmetered),
            _ => Err(format!("invalid network requirement: {s}")),
        }
    }
}

/// A single persisted transfer request.
///
/// `partial_bytes` is the crash-recovery checkpoint: the count of bytes known
/// to be durably on disk at the destination path. It is only ever `≤`
/// `total_bytes` once the total is known.
#[derive(Debug, Clone, FromRow)]
pub struct Task {
    /// Unique identifier, assigned by the store on insert.
    pub id: i64,
    /// Source URL.
    pub url: String,
    /// Full destination file path (directory and final name).
    pub dest_path: String,
    /// Owning collection identifier, when the host app groups transfers.
    pub collection: Option<String>,
    /// Display name shown in progress reporting.
    pub file_name: String,
    /// Expected total byte count; None until learned from the server.
    pub total_bytes: Option<i64>,
    /// Bytes already persisted to disk (checkpointed during streaming).
    pub partial_bytes: i64,
    /// Dispatch priority (stored as text, parsed via `priority()`).
    #[sqlx(rename = "priority")]
    pub priority_str: String,
    /// Network requirement (stored as text, parsed via `network()`).
    #[sqlx(rename = "network")]
    pub network_str: String,
    /// Earliest time this task may be dispatched; None means immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Current lifecycle status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Number of transitions into `error` so far.
    pub retry_count: i64,
    /// Last error message, if any attempt failed.
    pub last_error: Option<String>,
    /// Last known validator (ETag or equivalent) of the remote resource.
    pub validator: Option<String>,
    /// When the task was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the most recent attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task completed successfully.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Queued` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.status_str.parse().unwrap_or(TaskStatus::Queued)
    }

    /// Returns the parsed priority enum.
    ///
    /// Falls back to `Normal` if the priority string is invalid.
    #[must_use]
    pub fn priority(&self) -> TaskPriority {
        self.priority_str.parse().unwrap_or(TaskPriority::Normal)
    }

    /// Returns the parsed network requirement.
    ///
    /// Falls back to `Any` if the stored string is invalid.
    #[must_use]
    pub fn network(&self) -> NetworkRequirement {
        self.network_str.parse().unwrap_or(NetworkRequirement::Any)
    }

    /// Overwrites the stored status string.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status_str = status.as_str().to_string();
    }

    /// Destination as a filesystem path.
    #[must_use]
    pub fn destination(&self) -> &Path {
        Path::new(&self.dest_path)
    }

    /// Fraction of the transfer completed, when the total is known.
    #[must_use]
    pub fn progress_fraction(&self) -> Option<f64> {
        match self.total_bytes {
            #[allow(clippy::cast_precision_loss)]
            Some(total) if total > 0 => {
                Some((self.partial_bytes.max(0) as f64 / total as f64).clamp(0.0, 1.0))
            }
            Some(_) => Some(0.0),
            None => None,
        }
    }

    /// True when this task will never be dispatched again without caller
    /// intervention: completed, cancelled, or error with the retry budget
    /// spent.
    #[must_use]
    pub fn is_terminal(&self, max_retry_attempts: i64) -> bool {
        match self.status() {
            TaskStatus::Completed | TaskStatus::Cancelled => true,
            TaskStatus::Error => self.retry_count > max_retry_attempts,
            TaskStatus::Queued | TaskStatus::Downloading | TaskStatus::Paused => false,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task {{ id: {}, url: {}, status: {} }}",
            self.id,
            self.url,
            self.status()
        )
    }
}

/// Parameters for enqueueing a new transfer.
///
/// `dest_path` is the full file path the bytes land at; `file_name` is the
/// display name used in progress reporting (it does not have to match the
/// path's final component).
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Source URL.
    pub url: String,
    /// Full destination file path.
    pub dest_path: PathBuf,
    /// Display name.
    pub file_name: String,
    /// Owning collection identifier.
    pub collection: Option<String>,
    /// Dispatch priority.
    pub priority: TaskPriority,
    /// Network requirement.
    pub network: NetworkRequirement,
    /// Earliest dispatch time; None for immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Expected total bytes, when the caller already knows it.
    pub total_bytes: Option<u64>,
}

impl NewTask {
    /// Creates an immediately-dispatchable, normal-priority task.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        dest_path: impl Into<PathBuf>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            dest_path: dest_path.into(),
            file_name: file_name.into(),
            collection: None,
            priority: TaskPriority::default(),
            network: NetworkRequirement::default(),
            scheduled_at: None,
            total_bytes: None,
        }
    }

    /// Sets the dispatch priority.
    #[must_use]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the network requirement.
    #[must_use]
    pub fn with_network(mut self, network: NetworkRequirement) -> Self {
        self.network = network;
        self
    }

    /// Defers dispatch until the given time.
    #[must_use]
    pub fn with_schedule(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Associates the task with an owning collection.
    #[must_use]
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Records an already-known expected size.
    #[must_use]
    pub fn with_total_bytes(mut self, total: u64) -> Self {
        self.total_bytes = Some(total);
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn task_with(status: &str, priority: &str, network: &str) -> Task {
        Task {
            id: 1,
            url: "https://example.com/file.bin".to_string(),
            dest_path: "/tmp/file.bin".to_string(),
            collection: None,
            file_name: "file.bin".to_string(),
            total_bytes: None,
            partial_bytes: 0,
            priority_str: priority.to_string(),
            network_str: network.to_string(),
            scheduled_at: None,
            status_str: status.to_string(),
            retry_count: 0,
            last_error: None,
            validator: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    // ==================== TaskStatus Tests ====================

    #[test]
    fn test_task_status_as_str_round_trips() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Downloading,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
            TaskStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_task_status_from_str_invalid() {
        let result = "unknown".parse::<TaskStatus>();
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("invalid task status"));
    }

    #[test]
    fn test_task_status_serde_uses_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::Downloading);
    }

    // ==================== TaskPriority Tests ====================

    #[test]
    fn test_task_priority_ordering() {
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn test_task_priority_default_is_normal() {
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
    }

    #[test]
    fn test_task_priority_round_trips() {
        for priority in [TaskPriority::Low, TaskPriority::Normal, TaskPriority::High] {
            assert_eq!(priority.as_str().parse::<TaskPriority>().unwrap(), priority);
        }
    }

    // ==================== NetworkRequirement Tests ====================

    #[test]
    fn test_network_requirement_round_trips() {
        for network in [
            NetworkRequirement::Any,
            NetworkRequirement::WifiOnly,
            NetworkRequirement::Unmetered,
        ] {
            assert_eq!(
                network.as_str().parse::<NetworkRequirement>().unwrap(),
                network
            );
        }
    }

    #[test]
    fn test_network_requirement_serde_snake_case() {
        let json = serde_json::to_string(&NetworkRequirement::WifiOnly).unwrap();
        assert_eq!(json, "\"wifi_only\"");
    }

    // ==================== Task Tests ====================

    #[test]
    fn test_task_accessors_parse_stored_strings() {
        let task = task_with("downloading", "high", "wifi_only");
        assert_eq!(task.status(), TaskStatus::Downloading);
        assert_eq!(task.priority(), TaskPriority::High);
        assert_eq!(task.network(), NetworkRequirement::WifiOnly);
    }

    #[test]
    fn test_task_accessors_fall_back_on_garbage() {
        let task = task_with("garbage", "garbage", "garbage");
        assert_eq!(task.status(), TaskStatus::Queued);
        assert_eq!(task.priority(), TaskPriority::Normal);
        assert_eq!(task.network(), NetworkRequirement::Any);
    }

    #[test]
    fn test_task_set_status_updates_string() {
        let mut task = task_with("queued", "normal", "any");
        task.set_status(TaskStatus::Paused);
        assert_eq!(task.status_str, "paused");
        assert_eq!(task.status(), TaskStatus::Paused);
    }

    #[test]
    fn test_task_progress_fraction() {
        let mut task = task_with("downloading", "normal", "any");
        assert_eq!(task.progress_fraction(), None);

        task.total_bytes = Some(200);
        task.partial_bytes = 50;
        assert!((task.progress_fraction().unwrap() - 0.25).abs() < f64::EPSILON);

        task.partial_bytes = 200;
        assert!((task.progress_fraction().unwrap() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_task_is_terminal() {
        let mut task = task_with("completed", "normal", "any");
        assert!(task.is_terminal(3));

        task.set_status(TaskStatus::Error);
        task.retry_count = 3;
        assert!(!task.is_terminal(3), "within budget, still retryable");

        task.retry_count = 4;
        assert!(task.is_terminal(3), "budget exhausted");

        task.set_status(TaskStatus::Queued);
        assert!(!task.is_terminal(3));
    }

    #[test]
    fn test_task_display() {
        let task = task_with("queued", "normal", "any");
        let display = task.to_string();
        assert!(display.contains("example.com"));
        assert!(display.contains("queued"));
    }

    // ==================== NewTask Tests ====================

    #[test]
    fn test_new_task_defaults() {
        let new_task = NewTask::new("https://example.com/a.bin", "/tmp/a.bin", "a.bin");
        assert_eq!(new_task.priority, TaskPriority::Normal);
        assert_eq!(new_task.network, NetworkRequirement::Any);
        assert!(new_task.scheduled_at.is_none());
        assert!(new_task.collection.is_none());
        assert!(new_task.total_bytes.is_none());
    }

    #[test]
    fn test_new_task_builders() {
        let at = Utc::now();
        let new_task = NewTask::new("https://example.com/a.bin", "/tmp/a.bin", "a.bin")
            .with_priority(TaskPriority::High)
            .with_network(NetworkRequirement::Unmetered)
            .with_schedule(at)
            .with_collection("papers")
            .with_total_bytes(1024);
        assert_eq!(new_task.priority, TaskPriority::High);
        assert_eq!(new_task.network, NetworkRequirement::Unmetered);
        assert_eq!(new_task.scheduled_at, Some(at));
        assert_eq!(new_task.collection.as_deref(), Some("papers"));
        assert_eq!(new_task.total_bytes, Some(1024));
    }
}
