//! Typed events flowing through the orchestration bus.
//!
//! Subsystems communicate exclusively through [`Event`]s.  Payloads are
//! enum variants rather than stringly-typed topics, so a subscriber that
//! matches on the wrong shape fails to compile instead of failing at
//! runtime.  Request-style payloads (`NextTaskQuery`, `RequeueTask`)
//! carry a correlation id that a responder answers through
//! [`crate::bus::EventBus::respond`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Task vocabulary
// ---------------------------------------------------------------------------

/// Scheduling priority.  `P0` is dispatched before `P1`, `P1` before `P2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    P0 = 0,
    P1 = 1,
    P2 = 2,
}

impl TaskPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "P0" | "p0" => Some(Self::P0),
            "P1" | "p1" => Some(Self::P1),
            "P2" | "p2" => Some(Self::P2),
            _ => None,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::P1
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a delegated task.
///
/// ```text
/// BLOCKED --> QUEUED --> RUNNING --> COMPLETED
///    |           |          |   \--> FAILED
///    \--------- cancel -----/---...> CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Runnable and sitting in (or headed for) the priority queue.
    Queued,
    /// Waiting on at least one prerequisite that is not terminal-success.
    Blocked,
    /// A live worker owns the task.
    Running,
    /// The agent exited with code 0.
    Completed,
    /// Non-zero exit, spawn failure, or timeout.
    Failed,
    /// Cancelled by the caller before or during execution.
    Cancelled,
}

impl TaskStatus {
    /// Whether the status is terminal (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Lowercase form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Blocked => "blocked",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "blocked" => Some(Self::Blocked),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Uppercase form used on the JSON-RPC wire.
    pub fn wire_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Blocked => "BLOCKED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_str())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Discriminant used for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskPersisted,
    TaskQueued,
    TaskStarted,
    TaskUnblocked,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    ScheduleDue,
    NextTaskQuery,
    RequeueTask,
}

/// Event payloads.  Lifecycle events carry the ids a subscriber needs to
/// re-read authoritative state from the store; they are notifications,
/// not state transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// A delegated task was durably persisted (status QUEUED or BLOCKED).
    TaskPersisted { task_id: String },
    /// The task entered the priority queue.
    TaskQueued { task_id: String },
    /// A worker took ownership and the agent process was spawned.
    TaskStarted { task_id: String, worker_id: String },
    /// The task's last unresolved prerequisite reached terminal success.
    TaskUnblocked {
        task_id: String,
        prerequisite_id: String,
    },
    /// Terminal: agent exited 0.
    TaskCompleted { task_id: String, exit_code: i32 },
    /// Terminal: non-zero exit, spawn failure, or timeout.
    TaskFailed {
        task_id: String,
        exit_code: Option<i32>,
        reason: String,
    },
    /// Terminal: cancelled by the caller (or shutdown).
    TaskCancelled {
        task_id: String,
        reason: Option<String>,
    },
    /// A cron schedule came due; the schedule handler turns this into a
    /// fresh delegation.
    ScheduleDue {
        schedule_id: String,
        prompt: String,
        priority: TaskPriority,
    },
    /// Request: hand over the queue head, if any.  Answered with
    /// [`ResponseValue::NextTask`].
    NextTaskQuery,
    /// Request: put a dispatched-but-unstarted task back at its queue
    /// position.  Answered with [`ResponseValue::Ack`].
    RequeueTask { task_id: String },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TaskPersisted { .. } => EventKind::TaskPersisted,
            Self::TaskQueued { .. } => EventKind::TaskQueued,
            Self::TaskStarted { .. } => EventKind::TaskStarted,
            Self::TaskUnblocked { .. } => EventKind::TaskUnblocked,
            Self::TaskCompleted { .. } => EventKind::TaskCompleted,
            Self::TaskFailed { .. } => EventKind::TaskFailed,
            Self::TaskCancelled { .. } => EventKind::TaskCancelled,
            Self::ScheduleDue { .. } => EventKind::ScheduleDue,
            Self::NextTaskQuery => EventKind::NextTaskQuery,
            Self::RequeueTask { .. } => EventKind::RequeueTask,
        }
    }
}

/// An event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique, time-ordered event identifier.
    pub event_id: Uuid,
    /// Emission time, epoch milliseconds.
    pub timestamp: i64,
    /// The typed payload.
    pub payload: EventPayload,
    /// Present on request-style events; responders echo it back through
    /// the bus's pending table.
    pub correlation_id: Option<Uuid>,
}

impl Event {
    /// Wrap a payload in a fresh envelope (no correlation id).
    pub fn new(payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            timestamp: Utc::now().timestamp_millis(),
            payload,
            correlation_id: None,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Values a responder can send back for a correlated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseValue {
    /// Answer to [`EventPayload::NextTaskQuery`]: the dequeued task id.
    NextTask(Option<String>),
    /// Generic acknowledgement.
    Ack,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
