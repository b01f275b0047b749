//! Task persistence backed by SQLite.
//!
//! # Overview
//!
//! Every transfer the engine manages is a row in the `tasks` table. The
//! scheduler keeps its working set in memory and writes through to this
//! module on every state transition, so a crash at any point leaves behind
//! enough state to resume: partially written files keep their byte
//! checkpoints, and anything that was mid-flight is reset to `queued` on the
//! next startup.
//!
//! # Example
//!
//! ```no_run
//! use downlink::{Database, NewTask, SqliteTaskStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new_in_memory().await?;
//! let store = SqliteTaskStore::new(&db);
//! let task = store
//!     .insert(&NewTask::new(
//!         "https://example.com/data.bin",
//!         "/tmp/data.bin",
//!         "data.bin",
//!     ))
//!     .await?;
//! println!("enqueued task {}", task.id);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod model;
pub mod store;

pub use error::{Result, StoreError};
pub use model::{NetworkRequirement, NewTask, Task, TaskPriority, TaskStatus};
pub use store::TaskStore;

use sqlx::SqlitePool;
use tracing::instrument;

use crate::db::Database;

/// SQLite-backed task store.
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Creates a store over an initialized database.
    #[must_use]
    pub fn new(database: &Database) -> Self {
        Self {
            pool: database.pool().clone(),
        }
    }

    /// Inserts a new task in `queued` status and returns the stored row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self, new_task), fields(url = %new_task.url))]
    pub async fn insert(&self, new_task: &NewTask) -> Result<Task> {
        let dest_path = new_task.dest_path.to_string_lossy();
        let total_bytes = new_task.total_bytes.and_then(|t| i64::try_from(t).ok());

        let task = sqlx::query_as::<_, Task>(
            r"
            INSERT INTO tasks (
                url, dest_path, collection, file_name, total_bytes,
                priority, network, scheduled_at, status, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            ",
        )
        .bind(&new_task.url)
        .bind(dest_path.as_ref())
        .bind(&new_task.collection)
        .bind(&new_task.file_name)
        .bind(total_bytes)
        .bind(new_task.priority.as_str())
        .bind(new_task.network.as_str())
        .bind(new_task.scheduled_at)
        .bind(TaskStatus::Queued.as_str())
        .bind(chrono::Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(task)
    }

    /// Retrieves a task by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if no task has the given id, or
    /// [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Task> {
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::TaskNotFound(id))
    }

    /// Writes the full state of a task, inserting the row if it does not
    /// exist. Idempotent by task id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    #[instrument(skip(self, task), fields(id = task.id, status = %task.status_str))]
    pub async fn upsert(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO tasks (
                id, url, dest_path, collection, file_name, total_bytes,
                partial_bytes, priority, network, scheduled_at, status,
                retry_count, last_error, validator, created_at, started_at,
                completed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                dest_path = excluded.dest_path,
                collection = excluded.collection,
                file_name = excluded.file_name,
                total_bytes = excluded.total_bytes,
                partial_bytes = excluded.partial_bytes,
                priority = excluded.priority,
                network = excluded.network,
                scheduled_at = excluded.scheduled_at,
                status = excluded.status,
                retry_count = excluded.retry_count,
                last_error = excluded.last_error,
                validator = excluded.validator,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at
            ",
        )
        .bind(task.id)
        .bind(&task.url)
        .bind(&task.dest_path)
        .bind(&task.collection)
        .bind(&task.file_name)
        .bind(task.total_bytes)
        .bind(task.partial_bytes)
        .bind(&task.priority_str)
        .bind(&task.network_str)
        .bind(task.scheduled_at)
        .bind(&task.status_str)
        .bind(task.retry_count)
        .bind(&task.last_error)
        .bind(&task.validator)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Deletes a task by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if no task has the given id, or
    /// [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        check_affected(id, result.rows_affected())
    }

    /// Persists a streaming checkpoint for a task.
    ///
    /// A `None` total or validator leaves the previously stored value in
    /// place, so a checkpoint never erases information learned earlier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if no task has the given id, or
    /// [`StoreError::Database`] if the update fails.
    #[instrument(skip(self, validator))]
    pub async fn checkpoint_progress(
        &self,
        id: i64,
        partial_bytes: i64,
        total_bytes: Option<i64>,
        validator: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE tasks
            SET partial_bytes = ?,
                total_bytes = COALESCE(?, total_bytes),
                validator = COALESCE(?, validator)
            WHERE id = ?
            ",
        )
        .bind(partial_bytes)
        .bind(total_bytes)
        .bind(validator)
        .bind(id)
        .execute(&self.pool)
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Lists all tasks with the given status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }

    /// Lists every task, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<Task>> {
        let tasks =
            sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at ASC, id ASC")
                .fetch_all(&self.pool)
                .await?;

        Ok(tasks)
    }

    /// Moves all `downloading` tasks back to `queued` and returns how many
    /// were reset.
    ///
    /// Called once at startup: any task that was mid-flight when the previous
    /// process died still has its byte checkpoint, so re-queueing it lets the
    /// next attempt resume from disk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset_downloading(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE tasks SET status = ? WHERE status = ?")
            .bind(TaskStatus::Queued.as_str())
            .bind(TaskStatus::Downloading.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Maps a zero-rows-affected result to [`StoreError::TaskNotFound`].
fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        return Err(StoreError::TaskNotFound(id));
    }
    Ok(())
}
