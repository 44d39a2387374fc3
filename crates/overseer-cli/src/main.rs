//! CLI entry point for overseer.
//!
//! `overseer serve` runs the daemon on stdio; the other subcommands are
//! one-shot clients (spawning a daemon child for task operations, or
//! touching the schedule store directly for schedule management).
//! Exit code is 0 on success and 1 on any error.

mod cli;
mod client;
mod helpers;
mod rpc;
mod tools;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use overseer_engine::Daemon;
use overseer_kernel::{Config, TaskPriority};
use serde_json::{json, Value};
use tracing::info;

use crate::cli::{Cli, Commands, ScheduleAction};
use crate::client::DaemonClient;
use crate::helpers::{format_millis, init_tracing};
use crate::rpc::RpcServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (silently ignore if missing).
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => cmd_serve().await,
        Commands::Delegate {
            prompt,
            priority,
            timeout,
            working_directory,
            use_worktree,
            depends_on,
            wait,
        } => {
            cmd_delegate(
                prompt,
                priority,
                timeout,
                working_directory,
                use_worktree,
                depends_on,
                wait,
            )
            .await
        }
        Commands::Status { task_id } => cmd_status(task_id).await,
        Commands::Logs { task_id, tail } => cmd_logs(task_id, tail).await,
        Commands::Cancel { task_id, reason } => cmd_cancel(task_id, reason).await,
        Commands::Schedule { action } => cmd_schedule(action).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: serve
// ---------------------------------------------------------------------------

async fn cmd_serve() -> Result<()> {
    init_tracing("info");

    let config = Config::from_env();
    let daemon = Daemon::start(config)
        .await
        .context("daemon failed to start")?;

    let server = RpcServer::new(daemon.manager());

    // Serve until stdin closes or a termination signal arrives.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("cannot install SIGTERM handler")?;
    tokio::select! {
        result = server.run() => {
            result.context("JSON-RPC server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received");
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received");
        }
    }

    daemon.shutdown().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Task subcommands (daemon clients)
// ---------------------------------------------------------------------------

async fn cmd_delegate(
    prompt: String,
    priority: String,
    timeout: Option<u64>,
    working_directory: Option<String>,
    use_worktree: bool,
    depends_on: Vec<String>,
    wait: bool,
) -> Result<()> {
    init_tracing("warn");
    if TaskPriority::parse(&priority).is_none() {
        bail!("unknown priority `{priority}` (expected P0, P1, or P2)");
    }

    let mut client = DaemonClient::spawn().await?;
    let mut arguments = json!({
        "prompt": prompt,
        "priority": priority,
        "useWorktree": use_worktree,
        "dependsOn": depends_on,
    });
    if let Some(timeout) = timeout {
        arguments["timeout"] = json!(timeout);
    }
    if let Some(cwd) = working_directory {
        arguments["workingDirectory"] = json!(cwd);
    }

    let result = client.call_tool("DelegateTask", arguments).await?;
    let task_id = result
        .get("taskId")
        .and_then(Value::as_str)
        .context("daemon returned no taskId")?
        .to_string();
    println!("{task_id} {}", result["status"].as_str().unwrap_or("?"));

    if wait {
        loop {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let status = client
                .call_tool("TaskStatus", json!({ "taskId": task_id }))
                .await?;
            let state = status["status"].as_str().unwrap_or("?").to_string();
            if ["COMPLETED", "FAILED", "CANCELLED"].contains(&state.as_str()) {
                println!("{task_id} {state}");
                client.shutdown().await?;
                if state != "COMPLETED" {
                    bail!("task finished as {state}");
                }
                return Ok(());
            }
        }
    }

    client.shutdown().await?;
    Ok(())
}

async fn cmd_status(task_id: Option<String>) -> Result<()> {
    init_tracing("warn");
    let mut client = DaemonClient::spawn().await?;

    let arguments = match &task_id {
        Some(id) => json!({ "taskId": id }),
        None => json!({}),
    };
    let result = client.call_tool("TaskStatus", arguments).await?;

    match result {
        Value::Array(tasks) => {
            for task in tasks {
                print_status_line(&task);
            }
        }
        task => print_status_line(&task),
    }
    client.shutdown().await?;
    Ok(())
}

fn print_status_line(task: &Value) {
    let created = task["createdAt"].as_i64().map(format_millis).unwrap_or_default();
    println!(
        "{}  {:<9}  {}  created {}",
        task["taskId"].as_str().unwrap_or("?"),
        task["status"].as_str().unwrap_or("?"),
        task["priority"].as_str().unwrap_or("?"),
        created,
    );
}

async fn cmd_logs(task_id: String, tail: Option<u64>) -> Result<()> {
    init_tracing("warn");
    let mut client = DaemonClient::spawn().await?;

    let mut arguments = json!({ "taskId": task_id });
    if let Some(tail) = tail {
        arguments["tail"] = json!(tail);
    }
    let result = client.call_tool("TaskLogs", arguments).await?;

    for line in result["stdout"].as_array().into_iter().flatten() {
        if let Some(text) = line.as_str() {
            println!("{text}");
        }
    }
    for line in result["stderr"].as_array().into_iter().flatten() {
        if let Some(text) = line.as_str() {
            eprintln!("{text}");
        }
    }
    client.shutdown().await?;
    Ok(())
}

async fn cmd_cancel(task_id: String, reason: Option<String>) -> Result<()> {
    init_tracing("warn");
    let mut client = DaemonClient::spawn().await?;

    let mut arguments = json!({ "taskId": task_id });
    if let Some(reason) = reason {
        arguments["reason"] = json!(reason);
    }
    client.call_tool("CancelTask", arguments).await?;
    println!("cancelled {task_id}");
    client.shutdown().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: schedule (direct store access)
// ---------------------------------------------------------------------------

async fn cmd_schedule(action: ScheduleAction) -> Result<()> {
    init_tracing("warn");

    let config = Config::from_env();
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("cannot create {}", config.data_dir.display()))?;
    let db = overseer_store::Database::open_and_migrate(config.db_path())
        .await
        .context("failed to open the overseer database")?;
    let schedules = overseer_store::ScheduleStore::new(db);

    match action {
        ScheduleAction::Create {
            cron,
            prompt,
            timezone,
            priority,
        } => {
            let priority = TaskPriority::parse(&priority)
                .with_context(|| format!("unknown priority `{priority}`"))?;
            // Validate expression and timezone up front, and show the
            // next few firings so a bad schedule is obvious immediately.
            let preview =
                overseer_cron::get_next_run_times(&cron, &timezone, 3, chrono::Utc::now())?;
            let next_run_at =
                overseer_cron::expression::next_run_millis(&cron, &timezone, chrono::Utc::now())?;

            let schedule = overseer_store::Schedule {
                id: uuid::Uuid::now_v7().to_string(),
                cron_expression: cron,
                timezone,
                prompt,
                priority,
                enabled: true,
                next_run_at,
                last_run_at: None,
                created_at: chrono::Utc::now().timestamp_millis(),
            };
            schedules.save_schedule(&schedule).await?;

            println!("created schedule {}", schedule.id);
            for time in preview {
                println!("  next: {}", time.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        ScheduleAction::List => {
            for schedule in schedules.find_all_schedules().await? {
                let state = if schedule.enabled { "enabled" } else { "disabled" };
                let next = schedule
                    .next_run_at
                    .map(format_millis)
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {:<8}  \"{}\" {} next {}",
                    schedule.id, state, schedule.cron_expression, schedule.timezone, next,
                );
            }
        }
        ScheduleAction::Delete { id } => {
            schedules.delete_schedule(&id).await?;
            println!("deleted {id}");
        }
        ScheduleAction::Enable { id } => {
            let schedule = schedules
                .find_schedule_by_id(&id)
                .await?
                .with_context(|| format!("schedule {id} not found"))?;
            let next_run_at = overseer_cron::expression::next_run_millis(
                &schedule.cron_expression,
                &schedule.timezone,
                chrono::Utc::now(),
            )?;
            schedules.set_enabled(&id, true, next_run_at).await?;
            println!("enabled {id}");
        }
        ScheduleAction::Disable { id } => {
            schedules.set_enabled(&id, false, None).await?;
            println!("disabled {id}");
        }
    }
    Ok(())
}
