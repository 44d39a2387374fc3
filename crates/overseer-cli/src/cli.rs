//! Command-line surface.

use clap::{Parser, Subcommand};

/// Local task-delegation daemon: queue prompts for an agent subprocess,
/// track their lifecycle, and schedule recurring delegations.
#[derive(Debug, Parser)]
#[command(name = "overseer", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the daemon, speaking line-framed JSON-RPC on stdin/stdout.
    Serve,

    /// Delegate one task to a daemon instance.
    Delegate {
        /// The prompt handed to the agent subprocess.
        prompt: String,
        /// Scheduling priority: P0, P1, or P2.
        #[arg(long, default_value = "P1")]
        priority: String,
        /// Wall-clock timeout in milliseconds.
        #[arg(long)]
        timeout: Option<u64>,
        /// Working directory for the agent process.
        #[arg(long)]
        working_directory: Option<String>,
        /// Run the agent in an isolated git worktree.
        #[arg(long)]
        use_worktree: bool,
        /// Prerequisite task ids (repeatable).
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
        /// Wait for the task to reach a terminal state.
        #[arg(long)]
        wait: bool,
    },

    /// Show the status of one task, or of every known task.
    Status {
        /// Task id; omit for all tasks.
        task_id: Option<String>,
    },

    /// Print the captured output of a task.
    Logs {
        task_id: String,
        /// Keep only the last N lines per stream.
        #[arg(long)]
        tail: Option<u64>,
    },

    /// Cancel a queued, blocked, or running task.
    Cancel {
        task_id: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Manage recurring schedules.
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ScheduleAction {
    /// Create a schedule from a 5-field cron expression.
    Create {
        /// Cron expression, e.g. "0 9 * * 1-5".
        cron: String,
        /// The prompt delegated on each firing.
        prompt: String,
        /// IANA timezone the expression is evaluated in.
        #[arg(long, default_value = "UTC")]
        timezone: String,
        /// Scheduling priority: P0, P1, or P2.
        #[arg(long, default_value = "P1")]
        priority: String,
    },
    /// List all schedules.
    List,
    /// Delete a schedule.
    Delete { id: String },
    /// Enable a schedule (recomputes its next firing).
    Enable { id: String },
    /// Disable a schedule.
    Disable { id: String },
}
