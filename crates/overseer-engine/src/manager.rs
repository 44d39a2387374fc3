//! The task manager: the authoritative lifecycle state machine.
//!
//! All mutations of a task go through here.  Every transition persists
//! to the store **before** the corresponding event is emitted, so a
//! subscriber that re-reads the row always observes at least the state
//! the event announced.  Store writes are retried locally with a fixed
//! backoff before failing the originating request as `STORE_ERROR`.
//!
//! ```text
//!               (prereq resolved)
//! BLOCKED ────────────────────────▶ QUEUED
//!    │                                │
//!    │ (cancel)                       │ (dispatch)
//!    ▼                                ▼
//! CANCELLED ◀───(cancel)───────── RUNNING ──(exit=0)──▶ COMPLETED
//!                                   │  │
//!                          (exit≠0) │  │ (timeout/kill)
//!                                   ▼  ▼
//!                                 FAILED / CANCELLED
//! ```

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use overseer_kernel::{
    Config, ErrorKind, EventBus, EventPayload, PriorityQueue, TaskError, TaskPriority, TaskResult,
    TaskStatus,
};
use overseer_store::{
    new_task, OutputStore, Task, TaskOutput, TaskStore,
};
use tracing::{debug, error, info, warn};

use crate::capture::OutputCapture;
use crate::checkpoint::CheckpointRecorder;
use crate::resolver::DependencyResolver;
use crate::supervisor::{ExitClass, KillReason};
use crate::worker::{new_worker_id, WorkerExit, WorkerPool};

/// Validated caller input for `delegate`.
#[derive(Debug, Clone, Default)]
pub struct DelegateSpec {
    pub prompt: String,
    pub priority: Option<TaskPriority>,
    pub timeout_ms: Option<u64>,
    pub max_output_buffer: Option<u64>,
    pub working_directory: Option<String>,
    pub use_worktree: bool,
    pub depends_on: Vec<String>,
    pub session_id: Option<String>,
}

/// Public façade over the task lifecycle.
pub struct TaskManager {
    config: Config,
    bus: EventBus,
    queue: Arc<PriorityQueue>,
    pool: Arc<WorkerPool>,
    tasks: TaskStore,
    outputs: OutputStore,
    resolver: DependencyResolver,
    checkpoints: CheckpointRecorder,
}

impl TaskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        bus: EventBus,
        queue: Arc<PriorityQueue>,
        pool: Arc<WorkerPool>,
        tasks: TaskStore,
        outputs: OutputStore,
        resolver: DependencyResolver,
        checkpoints: CheckpointRecorder,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            queue,
            pool,
            tasks,
            outputs,
            resolver,
            checkpoints,
        })
    }

    // -----------------------------------------------------------------
    // delegate
    // -----------------------------------------------------------------

    /// Validate, persist (QUEUED or BLOCKED), emit `TaskPersisted`, and
    /// return the stored task.
    pub async fn delegate(&self, spec: DelegateSpec) -> TaskResult<Task> {
        if spec.prompt.trim().is_empty() {
            return Err(TaskError::invalid_input("prompt must not be empty"));
        }
        if let Some(timeout) = spec.timeout_ms {
            self.config.validate_timeout_ms(timeout)?;
        }
        if let Some(buffer) = spec.max_output_buffer {
            self.config.validate_buffer_bytes(buffer)?;
        }

        let mut task = new_task(spec.prompt, spec.priority.unwrap_or_default());
        task.timeout_ms = spec.timeout_ms;
        task.max_output_buffer = spec.max_output_buffer;
        task.working_directory = spec.working_directory;
        task.use_worktree = spec.use_worktree;
        task.session_id = spec.session_id;

        let depends_on = spec.depends_on;
        let persisted = self
            .with_retry("create task", || {
                self.tasks.create_with_dependencies(&task, &depends_on)
            })
            .await?;

        info!(task_id = %persisted.id, status = %persisted.status, priority = %persisted.priority, "task delegated");

        self.bus
            .emit(EventPayload::TaskPersisted {
                task_id: persisted.id.clone(),
            })
            .await?;

        Ok(persisted)
    }

    // -----------------------------------------------------------------
    // queries
    // -----------------------------------------------------------------

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// One task by id.
    pub async fn get_task(&self, id: &str) -> TaskResult<Task> {
        self.tasks
            .find_task_by_id(id)
            .await?
            .ok_or_else(|| TaskError::not_found("task", id))
    }

    /// All tasks, oldest first.
    pub async fn list_tasks(&self) -> TaskResult<Vec<Task>> {
        Ok(self.tasks.find_all_tasks().await?)
    }

    /// Captured logs of a task: the live capture while it runs, the
    /// persisted row afterwards.
    pub async fn get_logs(&self, id: &str, tail: Option<usize>) -> TaskResult<TaskOutput> {
        let task = self.get_task(id).await?;

        let mut output = match self.pool.capture_for(&task.id) {
            Some(capture) => capture.snapshot(),
            None => self.outputs.read_output(&task.id).await?,
        };
        if let Some(tail) = tail {
            truncate_to_tail(&mut output.stdout, tail);
            truncate_to_tail(&mut output.stderr, tail);
        }
        Ok(output)
    }

    // -----------------------------------------------------------------
    // cancel
    // -----------------------------------------------------------------

    /// Cancel a task.
    ///
    /// QUEUED: removed from the queue and finalized immediately.
    /// BLOCKED: finalized immediately.  RUNNING: the cancel intent is
    /// persisted, the worker signalled, and the terminal event confirms
    /// the kill.  Terminal states reject with `CONFLICT_STATE`.
    pub async fn cancel(&self, id: &str, reason: Option<String>) -> TaskResult<()> {
        let task = self.get_task(id).await?;

        match task.status {
            TaskStatus::Queued => {
                self.queue.remove(&task.id);
                self.finalize_cancelled(&task, reason).await
            }
            TaskStatus::Blocked => self.finalize_cancelled(&task, reason).await,
            TaskStatus::Running => {
                // Persist intent first; the exit report finalizes.  The
                // compare-and-set loses when the worker exited between
                // our fetch and now — then the task is already terminal.
                let accepted = self
                    .with_retry("persist cancel intent", || {
                        self.tasks.transition_status(
                            &task.id,
                            TaskStatus::Running,
                            TaskStatus::Cancelled,
                        )
                    })
                    .await?;
                if !accepted {
                    let current = self.get_task(&task.id).await?;
                    return Err(TaskError::conflict_state(format!(
                        "cannot cancel task {} in state {}",
                        task.id, current.status
                    ))
                    .with_context("status", current.status.wire_str()));
                }
                if !self.pool.kill_task(&task.id, KillReason::Cancel) {
                    // Worker already gone: the exit report raced us and
                    // will observe the cancelled row.
                    debug!(task_id = %task.id, "cancel raced worker exit");
                }
                info!(task_id = %task.id, ?reason, "cancellation signalled");
                Ok(())
            }
            // Completed, Failed, Cancelled.
            status => Err(TaskError::conflict_state(format!(
                "cannot cancel task {} in state {status}",
                task.id
            ))
            .with_context("status", status.wire_str())),
        }
    }

    /// Cancellation of a task that is not running: terminalize and emit.
    async fn finalize_cancelled(&self, task: &Task, reason: Option<String>) -> TaskResult<()> {
        let now = Utc::now().timestamp_millis();
        self.with_retry("persist cancellation", || {
            self.tasks
                .mark_terminal(&task.id, TaskStatus::Cancelled, None, now)
        })
        .await?;
        info!(task_id = %task.id, ?reason, "task cancelled");
        self.bus
            .emit(EventPayload::TaskCancelled {
                task_id: task.id.clone(),
                reason,
            })
            .await
    }

    // -----------------------------------------------------------------
    // dispatch
    // -----------------------------------------------------------------

    /// Move a QUEUED task to RUNNING and spawn its worker.
    ///
    /// Persists the RUNNING row (with the assigned worker id) before the
    /// process is spawned.  A spawn failure transitions straight to
    /// FAILED; hitting the concurrency cap reverts the task to QUEUED
    /// and re-queues it through the bus.
    pub async fn start_task(&self, task: &Task) -> TaskResult<()> {
        let prompt = self.checkpoints.enrich_prompt(task).await?;
        self.propagate_session(task).await?;

        let worker_id = new_worker_id();
        let started_at = Utc::now().timestamp_millis();
        let dispatched = self
            .with_retry("persist running", || {
                self.tasks.mark_running(&task.id, &worker_id, started_at)
            })
            .await?;
        if !dispatched {
            // Cancelled (or otherwise moved on) between dequeue and
            // dispatch; drop silently.
            debug!(task_id = %task.id, "dispatch lost a status race, dropping");
            return Ok(());
        }

        let budget = task
            .max_output_buffer
            .unwrap_or(self.config.max_output_buffer);
        let capture = Arc::new(OutputCapture::new(
            task.id.clone(),
            budget,
            self.config.spill_dir(),
        ));

        match self.pool.spawn(task, &prompt, &worker_id, capture).await {
            Ok(()) => {
                self.bus
                    .emit(EventPayload::TaskStarted {
                        task_id: task.id.clone(),
                        worker_id,
                    })
                    .await
            }
            Err(err) if err.kind() == ErrorKind::ResourceExhausted => {
                // The cap shrank between admission check and spawn; put
                // the task back.
                warn!(task_id = %task.id, "spawn hit the worker cap, requeueing");
                self.with_retry("revert to queued", || {
                    self.tasks
                        .transition_status(&task.id, TaskStatus::Running, TaskStatus::Queued)
                })
                .await?;
                self.bus
                    .request(EventPayload::RequeueTask {
                        task_id: task.id.clone(),
                    })
                    .await?;
                Ok(())
            }
            Err(err) => {
                error!(task_id = %task.id, %err, "agent spawn failed");
                let now = Utc::now().timestamp_millis();
                self.with_retry("persist spawn failure", || {
                    self.tasks
                        .mark_terminal(&task.id, TaskStatus::Failed, Some(-1), now)
                })
                .await?;
                self.bus
                    .emit(EventPayload::TaskFailed {
                        task_id: task.id.clone(),
                        exit_code: Some(-1),
                        reason: err.to_string(),
                    })
                    .await?;
                Ok(())
            }
        }
    }

    /// Copy a continuation token from the first prerequisite that has
    /// one, when the task itself has none.
    async fn propagate_session(&self, task: &Task) -> TaskResult<()> {
        if task.session_id.is_some() {
            return Ok(());
        }
        for prereq_id in self.resolver.prerequisites_of(&task.id).await? {
            if let Some(prereq) = self.tasks.find_task_by_id(&prereq_id).await? {
                if let Some(session) = prereq.session_id {
                    debug!(task_id = %task.id, from = %prereq_id, "session token inherited");
                    self.tasks.inherit_session(&task.id, &session).await?;
                    break;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // exit handling
    // -----------------------------------------------------------------

    /// Handle one worker exit report: persist output, terminalize, write
    /// the checkpoint, emit the terminal event.
    pub async fn on_worker_exit(&self, exit: WorkerExit) -> TaskResult<()> {
        let Some(task) = self.tasks.find_task_by_id(&exit.task_id).await? else {
            warn!(task_id = %exit.task_id, "exit report for unknown task dropped");
            return Ok(());
        };

        let now = Utc::now().timestamp_millis();
        // A cancel persisted while the process was dying wins over the
        // raw classification.
        let cancelled_intent = task.status == TaskStatus::Cancelled;
        let (status, exit_code, failure_reason) = if cancelled_intent {
            (TaskStatus::Cancelled, None, None)
        } else {
            match exit.class {
                ExitClass::Completed => (TaskStatus::Completed, Some(0), None),
                ExitClass::Failed => (
                    TaskStatus::Failed,
                    Some(exit.exit_code.unwrap_or(-1)),
                    Some(format!(
                        "agent exited with code {}",
                        exit.exit_code.unwrap_or(-1)
                    )),
                ),
                ExitClass::TimedOut => (
                    TaskStatus::Failed,
                    Some(-1),
                    Some(
                        TaskError::timeout(format!(
                            "task exceeded its timeout of {} ms",
                            task.timeout_ms.unwrap_or(self.config.task_timeout_ms)
                        ))
                        .to_string(),
                    ),
                ),
                ExitClass::Cancelled => (TaskStatus::Cancelled, None, None),
            }
        };

        self.with_retry("persist terminal state", || {
            self.tasks
                .mark_terminal(&task.id, status, exit_code, now)
        })
        .await?;

        let output = self.persist_output(&task, &exit.capture).await?;

        if let Err(err) = self.checkpoints.record_terminal(&task, status, &output).await {
            // Checkpoints are enrichment, not lifecycle; log and move on.
            warn!(task_id = %task.id, %err, "checkpoint write failed");
        }

        info!(task_id = %task.id, status = %status, ?exit_code, "task finished");

        let payload = match status {
            TaskStatus::Completed => EventPayload::TaskCompleted {
                task_id: task.id.clone(),
                exit_code: 0,
            },
            TaskStatus::Failed => EventPayload::TaskFailed {
                task_id: task.id.clone(),
                exit_code,
                reason: failure_reason.unwrap_or_else(|| "agent failed".to_string()),
            },
            _ => EventPayload::TaskCancelled {
                task_id: task.id.clone(),
                reason: None,
            },
        };
        self.bus.emit(payload).await
    }

    /// Persist the final output snapshot for a task.
    async fn persist_output(
        &self,
        task: &Task,
        capture: &OutputCapture,
    ) -> TaskResult<TaskOutput> {
        let output = capture.snapshot();
        self.with_retry("persist output", || {
            self.outputs
                .save_output(&task.id, &output, task.timeout_ms, task.max_output_buffer)
        })
        .await?;
        capture.cleanup();
        Ok(output)
    }

    // -----------------------------------------------------------------
    // retry
    // -----------------------------------------------------------------

    /// Run a store operation with the configured local retry policy.
    ///
    /// Only infrastructure failures are retried; validation, not-found,
    /// cycle, and conflict errors surface immediately.
    async fn with_retry<T, F, Fut>(&self, op: &str, f: F) -> TaskResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = overseer_store::StoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if is_retryable(&err) && attempt < self.config.store_retries => {
                    warn!(op, attempt, %err, "store operation failed, retrying");
                    tokio::time::sleep(self.config.store_retry_backoff).await;
                }
                Err(err) => {
                    let task_err: TaskError = err.into();
                    if task_err.kind() == ErrorKind::StoreError {
                        error!(op, attempts = attempt, %task_err, "store operation failed permanently");
                    }
                    return Err(task_err);
                }
            }
        }
    }
}

/// Transient infrastructure failures are worth retrying; domain errors
/// are not.
fn is_retryable(err: &overseer_store::StoreError) -> bool {
    matches!(
        err,
        overseer_store::StoreError::Sqlite(_) | overseer_store::StoreError::TaskJoin(_)
    )
}

fn truncate_to_tail(lines: &mut Vec<String>, tail: usize) {
    if lines.len() > tail {
        *lines = lines.split_off(lines.len() - tail);
    }
}
