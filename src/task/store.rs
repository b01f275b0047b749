//! Storage abstraction for task persistence.
//!
//! [`TaskStore`] is the seam between the scheduler and the database. The
//! scheduler only ever talks to `Arc<dyn TaskStore>`, so tests can substitute
//! an in-memory database (or a custom implementation) without touching the
//! dispatch logic.

use async_trait::async_trait;

use super::error::Result;
use super::model::{NewTask, Task, TaskStatus};
use super::SqliteTaskStore;

/// Persistence operations required by the download engine.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a new task and returns the stored row with its assigned id.
    async fn insert(&self, new_task: &NewTask) -> Result<Task>;

    /// Retrieves a task by id.
    async fn get(&self, id: i64) -> Result<Task>;

    /// Writes the full state of a task back to storage, inserting the row if
    /// it does not exist yet. Idempotent by task id.
    async fn upsert(&self, task: &Task) -> Result<()>;

    /// Deletes a task by id.
    async fn delete(&self, id: i64) -> Result<()>;

    /// Persists a streaming checkpoint: bytes on disk, learned total size,
    /// and the resource validator.
    async fn checkpoint_progress(
        &self,
        id: i64,
        partial_bytes: i64,
        total_bytes: Option<i64>,
        validator: Option<&str>,
    ) -> Result<()>;

    /// Lists all tasks with the given status, oldest first.
    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;

    /// Lists every task, oldest first.
    async fn list_all(&self) -> Result<Vec<Task>>;

    /// Moves all `downloading` tasks back to `queued` and returns how many
    /// were reset. Called once at startup to recover from a crash.
    async fn reset_downloading(&self) -> Result<u64>;
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, new_task: &NewTask) -> Result<Task> {
        SqliteTaskStore::insert(self, new_task).await
    }

    async fn get(&self, id: i64) -> Result<Task> {
        SqliteTaskStore::get(self, id).await
    }

    async fn upsert(&self, task: &Task) -> Result<()> {
        SqliteTaskStore::upsert(self, task).await
    }

    async fn delete(&self, id: i64) -> Result<()> {
        SqliteTaskStore::delete(self, id).await
    }

    async fn checkpoint_progress(
        &self,
        id: i64,
        partial_bytes: i64,
        total_bytes: Option<i64>,
        validator: Option<&str>,
    ) -> Result<()> {
        SqliteTaskStore::checkpoint_progress(self, id, partial_bytes, total_bytes, validator).await
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        SqliteTaskStore::list_by_status(self, status).await
    }

    async fn list_all(&self) -> Result<Vec<Task>> {
        SqliteTaskStore::list_all(self).await
    }

    async fn reset_downloading(&self) -> Result<u64> {
        SqliteTaskStore::reset_downloading(self).await
    }
}
