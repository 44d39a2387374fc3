//! Persisted row types.

use overseer_kernel::{TaskPriority, TaskStatus};
use serde::{Deserialize, Serialize};

/// A delegated task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier (UUID v7), stable across restarts.
    pub id: String,
    /// The payload handed to the subprocess agent.
    pub prompt: String,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Working directory for the agent process; `None` means the
    /// daemon's own cwd.
    pub working_directory: Option<String>,
    /// Whether the agent should run in an isolated git worktree.
    pub use_worktree: bool,
    /// Per-task timeout override in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Per-task output budget override in bytes.
    pub max_output_buffer: Option<u64>,
    /// Continuation token propagated from prerequisites to dependents.
    pub session_id: Option<String>,
    /// Live worker id while RUNNING.
    pub worker_id: Option<String>,
    /// Agent exit code, present on COMPLETED/FAILED.
    pub exit_code: Option<i32>,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Captured output of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Total captured bytes across both streams.
    pub total_size: u64,
    /// Set when the capture degraded to dropping output.
    pub truncated: bool,
}

/// Terminal classification recorded in a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointType {
    Completed,
    Failed,
    Cancelled,
}

impl CheckpointType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Summary of a task at a terminal transition, used to enrich the
/// prompts of its dependents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,
    pub checkpoint_type: CheckpointType,
    pub output_summary: Option<String>,
    pub error_summary: Option<String>,
    pub git_branch: Option<String>,
    pub git_commit_sha: Option<String>,
    pub git_dirty_files: Option<Vec<String>>,
    /// Epoch milliseconds.
    pub created_at: i64,
}

/// A recurring delegation definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    /// 5-field POSIX cron expression.
    pub cron_expression: String,
    /// IANA timezone name the expression is evaluated in.
    pub timezone: String,
    pub prompt: String,
    pub priority: TaskPriority,
    pub enabled: bool,
    /// Next planned firing, epoch milliseconds UTC.
    pub next_run_at: Option<i64>,
    /// Most recent firing, epoch milliseconds UTC.
    pub last_run_at: Option<i64>,
    pub created_at: i64,
}
