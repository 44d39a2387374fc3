//! Error taxonomy for the overseer daemon.
//!
//! Every fallible operation in the orchestration core returns a
//! [`TaskError`] via [`TaskResult`].  Errors carry a machine-readable
//! [`ErrorKind`] from a closed set plus a structured context map, so the
//! JSON-RPC surface can report a stable code without parsing messages.
//! Errors are returned across subsystem boundaries, never thrown.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Alias for `Result<T, TaskError>`.
pub type TaskResult<T> = Result<T, TaskError>;

/// The closed set of error codes surfaced by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// A caller-supplied argument failed validation.
    InvalidInput,
    /// The referenced entity does not exist.
    NotFound,
    /// The operation is not legal in the entity's current state.
    ConflictState,
    /// Inserting the dependency edge would close a cycle.
    DependencyCycle,
    /// The operation requires an unblocked task but found a blocked one.
    DependencyBlocked,
    /// A capacity limit (worker cap, admission predicate) was hit.
    ResourceExhausted,
    /// A wall-clock deadline elapsed.
    TaskTimeout,
    /// The agent subprocess could not be started.
    SpawnFailed,
    /// The persistent store failed after local retries.
    StoreError,
    /// Anything else: join failures, poisoned locks, handler panics.
    SystemError,
}

impl ErrorKind {
    /// Stable string code used on the wire and in logs.
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::NotFound => "NOT_FOUND",
            Self::ConflictState => "CONFLICT_STATE",
            Self::DependencyCycle => "DEPENDENCY_CYCLE",
            Self::DependencyBlocked => "DEPENDENCY_BLOCKED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::TaskTimeout => "TASK_TIMEOUT",
            Self::SpawnFailed => "SPAWN_FAILED",
            Self::StoreError => "STORE_ERROR",
            Self::SystemError => "SYSTEM_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// An error value carried across subsystem boundaries.
///
/// The context map holds structured detail (task ids, limits, the raw
/// store message) keyed by short snake_case names.  A `BTreeMap` keeps
/// the serialized form deterministic.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct TaskError {
    /// The machine-readable code.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Structured context for logs and the JSON-RPC error `data` field.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl TaskError {
    /// Create an error with an empty context map.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Attach a context entry (builder style).
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// The error's machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    // -- Constructors for the common kinds ----------------------------------

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(ErrorKind::NotFound, format!("{entity} not found: {id}"))
            .with_context("entity", entity)
            .with_context("id", id)
    }

    pub fn conflict_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConflictState, message)
    }

    pub fn dependency_cycle(task_id: impl Into<String>, prerequisite_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        let prerequisite_id = prerequisite_id.into();
        Self::new(
            ErrorKind::DependencyCycle,
            format!("dependency {task_id} -> {prerequisite_id} would close a cycle"),
        )
        .with_context("task_id", task_id)
        .with_context("prerequisite_id", prerequisite_id)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TaskTimeout, message)
    }

    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SpawnFailed, message)
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StoreError, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SystemError, message)
    }
}

impl From<tokio::task::JoinError> for TaskError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::system(format!("background task failed: {err}"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
