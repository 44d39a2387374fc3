//! Error types for the overseer-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].
//! At the engine boundary a `StoreError` converts into the daemon-wide
//! [`TaskError`] taxonomy; most variants map to `STORE_ERROR`, but
//! not-found, cycle, and validation failures keep their precise kinds.

use overseer_kernel::{ErrorKind, TaskError};
use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// The requested record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Inserting the edge would close a dependency cycle.
    #[error("dependency {task_id} -> {prerequisite_id} would close a cycle")]
    DependencyCycle {
        task_id: String,
        prerequisite_id: String,
    },

    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A row held a value the model cannot represent.
    #[error("corrupt row in {entity}: {message}")]
    CorruptRow {
        entity: &'static str,
        message: String,
    },

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => TaskError::not_found(entity, id),
            StoreError::DependencyCycle {
                task_id,
                prerequisite_id,
            } => TaskError::dependency_cycle(task_id, prerequisite_id),
            StoreError::InvalidArgument(message) => TaskError::invalid_input(message),
            other => TaskError::new(ErrorKind::StoreError, other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
