//! The task tool surface exposed over JSON-RPC.
//!
//! Four tools: `DelegateTask`, `TaskStatus`, `TaskLogs`, `CancelTask`.
//! Argument schemas are published through `tools/list` so generic
//! clients can discover them.

use std::sync::Arc;

use overseer_engine::{DelegateSpec, TaskManager};
use overseer_kernel::{ErrorKind, TaskError, TaskPriority, TaskResult};
use overseer_store::Task;
use serde::Serialize;
use serde_json::{json, Value};

use crate::rpc::{INTERNAL_ERROR, INVALID_PARAMS};

/// One tool advertised by `tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// All tool definitions, in a stable order.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "DelegateTask".into(),
            description: "Queue a prompt for execution by the agent subprocess".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "prompt": { "type": "string", "description": "The payload handed to the agent" },
                    "priority": { "type": "string", "enum": ["P0", "P1", "P2"], "description": "Scheduling priority, P0 highest (default P1)" },
                    "timeout": { "type": "integer", "description": "Wall-clock timeout in milliseconds" },
                    "maxOutputBuffer": { "type": "integer", "description": "In-memory output budget in bytes" },
                    "workingDirectory": { "type": "string", "description": "Working directory for the agent process" },
                    "useWorktree": { "type": "boolean", "description": "Run the agent in an isolated git worktree" },
                    "dependsOn": { "type": "array", "items": { "type": "string" }, "description": "Task ids that must complete first" }
                },
                "required": ["prompt"]
            }),
        },
        ToolDefinition {
            name: "TaskStatus".into(),
            description: "Status of one task, or of every known task".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "taskId": { "type": "string", "description": "Task id; omit for all tasks" }
                }
            }),
        },
        ToolDefinition {
            name: "TaskLogs".into(),
            description: "Captured stdout/stderr of a task".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "taskId": { "type": "string" },
                    "tail": { "type": "integer", "description": "Keep only the last N lines per stream" }
                },
                "required": ["taskId"]
            }),
        },
        ToolDefinition {
            name: "CancelTask".into(),
            description: "Cancel a queued, blocked, or running task".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "taskId": { "type": "string" },
                    "reason": { "type": "string" }
                },
                "required": ["taskId"]
            }),
        },
    ]
}

/// Dispatch one tool call.
pub async fn call(manager: &Arc<TaskManager>, name: &str, args: Value) -> TaskResult<Value> {
    match name {
        "DelegateTask" => delegate_task(manager, args).await,
        "TaskStatus" => task_status(manager, args).await,
        "TaskLogs" => task_logs(manager, args).await,
        "CancelTask" => cancel_task(manager, args).await,
        other => Err(TaskError::invalid_input(format!("unknown tool `{other}`"))
            .with_context("tool", other)),
    }
}

/// Map an error kind onto the JSON-RPC code space.
pub fn rpc_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::InvalidInput => INVALID_PARAMS,
        _ => INTERNAL_ERROR,
    }
}

// ---------------------------------------------------------------------------
// Tool implementations
// ---------------------------------------------------------------------------

async fn delegate_task(manager: &Arc<TaskManager>, args: Value) -> TaskResult<Value> {
    let prompt = require_str(&args, "prompt", "DelegateTask")?.to_string();

    let priority = match args.get("priority").and_then(Value::as_str) {
        Some(raw) => Some(TaskPriority::parse(raw).ok_or_else(|| {
            TaskError::invalid_input(format!("unknown priority `{raw}`"))
                .with_context("priority", raw)
        })?),
        None => None,
    };

    let depends_on = match args.get("dependsOn") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    TaskError::invalid_input("dependsOn entries must be task id strings")
                })
            })
            .collect::<TaskResult<Vec<_>>>()?,
        Some(_) => {
            return Err(TaskError::invalid_input("dependsOn must be an array of task ids"))
        }
    };

    let spec = DelegateSpec {
        prompt,
        priority,
        timeout_ms: args.get("timeout").and_then(Value::as_u64),
        max_output_buffer: args.get("maxOutputBuffer").and_then(Value::as_u64),
        working_directory: args
            .get("workingDirectory")
            .and_then(Value::as_str)
            .map(str::to_string),
        use_worktree: args
            .get("useWorktree")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        depends_on,
        session_id: None,
    };

    let task = manager.delegate(spec).await?;
    Ok(json!({ "taskId": task.id, "status": task.status.wire_str() }))
}

async fn task_status(manager: &Arc<TaskManager>, args: Value) -> TaskResult<Value> {
    match args.get("taskId").and_then(Value::as_str) {
        Some(task_id) => {
            let task = manager.get_task(task_id).await?;
            Ok(status_json(&task))
        }
        None => {
            let tasks = manager.list_tasks().await?;
            Ok(Value::Array(tasks.iter().map(status_json).collect()))
        }
    }
}

async fn task_logs(manager: &Arc<TaskManager>, args: Value) -> TaskResult<Value> {
    let task_id = require_str(&args, "taskId", "TaskLogs")?;
    let tail = args
        .get("tail")
        .and_then(Value::as_u64)
        .map(|n| n as usize);

    let output = manager.get_logs(task_id, tail).await?;
    Ok(json!({
        "stdout": output.stdout,
        "stderr": output.stderr,
        "totalSize": output.total_size,
        "truncated": output.truncated,
    }))
}

async fn cancel_task(manager: &Arc<TaskManager>, args: Value) -> TaskResult<Value> {
    let task_id = require_str(&args, "taskId", "CancelTask")?;
    let reason = args
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_string);

    manager.cancel(task_id, reason).await?;
    Ok(json!({ "cancelled": true }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn status_json(task: &Task) -> Value {
    json!({
        "taskId": task.id,
        "status": task.status.wire_str(),
        "priority": task.priority.as_str(),
        "createdAt": task.created_at,
        "startedAt": task.started_at,
        "completedAt": task.completed_at,
        "exitCode": task.exit_code,
    })
}

/// Extract a required string field from tool arguments.
fn require_str<'a>(args: &'a Value, field: &str, tool_name: &str) -> TaskResult<&'a str> {
    args.get(field).and_then(Value::as_str).ok_or_else(|| {
        TaskError::invalid_input(format!(
            "{tool_name}: missing required string field `{field}`"
        ))
        .with_context("field", field)
    })
}
