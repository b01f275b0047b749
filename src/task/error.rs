//! Error types for task persistence operations.

use thiserror::Error;

/// Errors produced by task store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying database operation failed.
    #[error("Database operation failed: {0}")]
    Database(#[from] sqlx::Error),

    /// No task exists with the given id.
    #[error("Task not found: {0}")]
    TaskNotFound(i64),
}

/// Result type for task store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
