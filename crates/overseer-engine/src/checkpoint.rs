//! Terminal checkpoints and dependent prompt enrichment.
//!
//! When a task with dependents reaches a terminal state, a checkpoint
//! summarising its outcome (tail of both streams, best-effort git
//! metadata from its working directory) is persisted.  When a dependent
//! later dispatches, the latest checkpoints of its prerequisites are
//! rendered into a "DEPENDENCY CONTEXT" section prepended to its prompt.

use chrono::Utc;
use overseer_kernel::{TaskResult, TaskStatus};
use overseer_store::{Checkpoint, CheckpointStore, CheckpointType, Task, TaskOutput};
use tokio::process::Command;
use tracing::{debug, trace};

use crate::resolver::DependencyResolver;

/// Lines of each stream kept in a summary.
const SUMMARY_LINES: usize = 20;
/// Byte ceiling per summary.
const SUMMARY_MAX_BYTES: usize = 4_096;

/// Header line prepended to enriched prompts.
pub const DEPENDENCY_CONTEXT_HEADER: &str = "DEPENDENCY CONTEXT:";

#[derive(Clone)]
pub struct CheckpointRecorder {
    checkpoints: CheckpointStore,
    resolver: DependencyResolver,
}

impl CheckpointRecorder {
    pub fn new(checkpoints: CheckpointStore, resolver: DependencyResolver) -> Self {
        Self {
            checkpoints,
            resolver,
        }
    }

    /// Record a checkpoint for a task that just went terminal.
    ///
    /// Tasks without dependents get no checkpoint — nobody will read it.
    pub async fn record_terminal(
        &self,
        task: &Task,
        status: TaskStatus,
        output: &TaskOutput,
    ) -> TaskResult<()> {
        if self.resolver.dependents_of(&task.id).await?.is_empty() {
            trace!(task_id = %task.id, "no dependents, skipping checkpoint");
            return Ok(());
        }

        let checkpoint_type = match status {
            TaskStatus::Completed => CheckpointType::Completed,
            TaskStatus::Cancelled => CheckpointType::Cancelled,
            _ => CheckpointType::Failed,
        };

        let git = capture_git_metadata(task.working_directory.as_deref()).await;

        let checkpoint = Checkpoint {
            task_id: task.id.clone(),
            checkpoint_type,
            output_summary: summarize(&output.stdout),
            error_summary: summarize(&output.stderr),
            git_branch: git.branch,
            git_commit_sha: git.commit_sha,
            git_dirty_files: git.dirty_files,
            created_at: Utc::now().timestamp_millis(),
        };
        self.checkpoints.save_checkpoint(&checkpoint).await?;
        debug!(task_id = %task.id, ?checkpoint_type, "checkpoint recorded");
        Ok(())
    }

    /// Build the "DEPENDENCY CONTEXT" section for a dispatching task, or
    /// `None` when it has no prerequisites.
    pub async fn build_dependency_context(&self, task: &Task) -> TaskResult<Option<String>> {
        let prerequisites = self.resolver.prerequisites_of(&task.id).await?;
        if prerequisites.is_empty() {
            return Ok(None);
        }

        let mut section = String::from(DEPENDENCY_CONTEXT_HEADER);
        for prereq_id in prerequisites {
            let Some(checkpoint) = self.checkpoints.find_latest_checkpoint(&prereq_id).await?
            else {
                continue;
            };
            section.push_str(&format!(
                "\n- prerequisite {} finished as {}",
                prereq_id,
                checkpoint.checkpoint_type.as_str()
            ));
            if let Some(summary) = &checkpoint.output_summary {
                section.push_str(&format!("\n  output:\n{}", indent(summary)));
            }
            if let Some(summary) = &checkpoint.error_summary {
                section.push_str(&format!("\n  errors:\n{}", indent(summary)));
            }
            if let Some(branch) = &checkpoint.git_branch {
                section.push_str(&format!("\n  git branch: {branch}"));
            }
            if let Some(sha) = &checkpoint.git_commit_sha {
                section.push_str(&format!("\n  git commit: {sha}"));
            }
            if let Some(dirty) = &checkpoint.git_dirty_files {
                if !dirty.is_empty() {
                    section.push_str(&format!("\n  dirty files: {}", dirty.join(", ")));
                }
            }
        }
        Ok(Some(section))
    }

    /// Prepend the dependency context (when present) to a prompt.
    pub async fn enrich_prompt(&self, task: &Task) -> TaskResult<String> {
        match self.build_dependency_context(task).await? {
            Some(context) => Ok(format!("{context}\n\n{}", task.prompt)),
            None => Ok(task.prompt.clone()),
        }
    }
}

/// Tail of a stream, capped by lines and bytes.
fn summarize(lines: &[String]) -> Option<String> {
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(SUMMARY_LINES);
    let mut summary = lines[start..].join("\n");
    if summary.len() > SUMMARY_MAX_BYTES {
        let cut = summary.len() - SUMMARY_MAX_BYTES;
        // Keep the tail; cut on a char boundary.
        let mut idx = cut;
        while !summary.is_char_boundary(idx) {
            idx += 1;
        }
        summary = summary.split_off(idx);
    }
    Some(summary)
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Git metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct GitMetadata {
    branch: Option<String>,
    commit_sha: Option<String>,
    dirty_files: Option<Vec<String>>,
}

/// Best-effort git state of the task's working directory.  Any failure
/// (no git, not a repository) simply yields empty metadata.
async fn capture_git_metadata(working_directory: Option<&str>) -> GitMetadata {
    let Some(cwd) = working_directory else {
        return GitMetadata::default();
    };

    let branch = git_stdout(cwd, &["rev-parse", "--abbrev-ref", "HEAD"]).await;
    if branch.is_none() {
        return GitMetadata::default();
    }
    let commit_sha = git_stdout(cwd, &["rev-parse", "HEAD"]).await;
    let dirty_files = git_stdout(cwd, &["status", "--porcelain"]).await.map(|out| {
        out.lines()
            .filter_map(|line| line.get(3..).map(str::to_string))
            .collect::<Vec<_>>()
    });

    GitMetadata {
        branch,
        commit_sha,
        dirty_files,
    }
}

async fn git_stdout(cwd: &str, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
