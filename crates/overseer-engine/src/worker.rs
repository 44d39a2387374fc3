//! The worker pool.
//!
//! One worker wraps one running agent subprocess.  The pool enforces
//! the autoscaler's concurrency cap at spawn time, arms a wall-clock
//! timeout timer per worker, and reports every exit through a single
//! channel that the daemon drains into the task manager.
//!
//! The worker map is guarded by one mutex; the lock is never held
//! across process I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use overseer_kernel::{Autoscaler, TaskError, TaskResult, WorkerGauge};
use overseer_store::Task;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::OutputCapture;
use crate::supervisor::{ExitClass, KillReason, ProcessKiller, ProcessSupervisor};

/// Exit report forwarded to the task manager.
#[derive(Clone)]
pub struct WorkerExit {
    pub worker_id: String,
    pub task_id: String,
    pub class: ExitClass,
    pub exit_code: Option<i32>,
    /// The worker's capture, carried along so the final snapshot can be
    /// persisted after the pool entry is gone.
    pub capture: Arc<OutputCapture>,
}

impl std::fmt::Debug for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerExit")
            .field("worker_id", &self.worker_id)
            .field("task_id", &self.task_id)
            .field("class", &self.class)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

struct WorkerEntry {
    task_id: String,
    pid: u32,
    #[allow(dead_code)]
    started_at: i64,
    killer: ProcessKiller,
    capture: Arc<OutputCapture>,
    timeout_timer: JoinHandle<()>,
}

/// Bounded pool of live workers.
pub struct WorkerPool {
    workers: Mutex<HashMap<String, WorkerEntry>>,
    gauge: WorkerGauge,
    autoscaler: Arc<Autoscaler>,
    supervisor: ProcessSupervisor,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
    default_timeout_ms: u64,
}

impl WorkerPool {
    pub fn new(
        supervisor: ProcessSupervisor,
        autoscaler: Arc<Autoscaler>,
        gauge: WorkerGauge,
        exit_tx: mpsc::UnboundedSender<WorkerExit>,
        default_timeout_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            workers: Mutex::new(HashMap::new()),
            gauge,
            autoscaler,
            supervisor,
            exit_tx,
            default_timeout_ms,
        })
    }

    /// Number of live workers.  O(1).
    pub fn worker_count(&self) -> usize {
        self.gauge.get()
    }

    /// Spawn a worker for `task` with an already-enriched prompt.
    ///
    /// `worker_id` is assigned by the caller so the RUNNING row can be
    /// persisted before the process exists.  Fails with
    /// `RESOURCE_EXHAUSTED` when the pool is at the autoscaler's cap.
    pub async fn spawn(
        self: &Arc<Self>,
        task: &Task,
        prompt: &str,
        worker_id: &str,
        capture: Arc<OutputCapture>,
    ) -> TaskResult<()> {
        let cap = self.autoscaler.current_cap();
        if self.gauge.get() >= cap {
            return Err(TaskError::resource_exhausted(format!(
                "worker pool at capacity ({cap})"
            ))
            .with_context("cap", cap as u64));
        }

        let (process, exit_rx) = self
            .supervisor
            .spawn(prompt, task.working_directory.as_deref(), Arc::clone(&capture))
            .await?;

        let timeout_ms = task.timeout_ms.unwrap_or(self.default_timeout_ms);
        let timer = arm_timeout(process.killer(), worker_id, timeout_ms);

        let entry = WorkerEntry {
            task_id: task.id.clone(),
            pid: process.pid,
            started_at: Utc::now().timestamp_millis(),
            killer: process.killer(),
            capture,
            timeout_timer: timer,
        };
        {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.insert(worker_id.to_string(), entry);
        }
        self.gauge.increment();
        info!(worker_id, task_id = %task.id, pid = process.pid, timeout_ms, "worker spawned");

        // Watch for the exit report and tear the worker down.
        let pool = Arc::clone(self);
        let worker_id = worker_id.to_string();
        let task_id = task.id.clone();
        tokio::spawn(async move {
            let exit = match exit_rx.await {
                Ok(exit) => exit,
                Err(_) => {
                    // Supervise task died without reporting; treat as failure.
                    warn!(worker_id, "exit report channel closed without a classification");
                    crate::supervisor::ProcessExit {
                        class: ExitClass::Failed,
                        exit_code: None,
                    }
                }
            };
            pool.finish_worker(&worker_id, &task_id, exit.class, exit.exit_code);
        });

        Ok(())
    }

    /// Signal one worker.  Returns false when the worker is already gone.
    pub fn kill(&self, worker_id: &str, reason: KillReason) -> bool {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        match workers.get(worker_id) {
            Some(entry) => {
                debug!(worker_id, pid = entry.pid, ?reason, "killing worker");
                entry.killer.kill(reason);
                true
            }
            None => false,
        }
    }

    /// Signal the worker running `task_id`, if any.
    pub fn kill_task(&self, task_id: &str, reason: KillReason) -> bool {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for entry in workers.values() {
            if entry.task_id == task_id {
                entry.killer.kill(reason);
                return true;
            }
        }
        false
    }

    /// The live capture for a running task, if any.
    pub fn capture_for(&self, task_id: &str) -> Option<Arc<OutputCapture>> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers
            .values()
            .find(|entry| entry.task_id == task_id)
            .map(|entry| Arc::clone(&entry.capture))
    }

    /// Shutdown: SIGTERM every worker concurrently, wait for the pool to
    /// drain, give up after the grace window (the supervise loops
    /// escalate to SIGKILL on their own).
    pub async fn kill_all(&self, grace: Duration) {
        let count = {
            let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            for entry in workers.values() {
                entry.killer.kill(KillReason::Shutdown);
            }
            workers.len()
        };
        if count == 0 {
            return;
        }
        info!(workers = count, "shutdown signalled to all workers");

        // Drain window: grace for SIGTERM plus the same again for the
        // supervise loops' SIGKILL escalation to land.
        let deadline = tokio::time::Instant::now() + grace * 2;
        while self.gauge.get() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.gauge.get();
        if remaining > 0 {
            warn!(remaining, "workers still live after shutdown grace window");
        }
    }

    /// Tear down a finished worker and forward the exit report.
    fn finish_worker(
        &self,
        worker_id: &str,
        task_id: &str,
        class: ExitClass,
        exit_code: Option<i32>,
    ) {
        let removed = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.remove(worker_id)
        };
        let Some(entry) = removed else {
            // finish raced another teardown path; report once only.
            return;
        };
        entry.timeout_timer.abort();
        self.gauge.decrement();
        debug!(worker_id, task_id, ?class, ?exit_code, "worker finished");

        let report = WorkerExit {
            worker_id: worker_id.to_string(),
            task_id: task_id.to_string(),
            class,
            exit_code,
            capture: entry.capture,
        };
        if self.exit_tx.send(report).is_err() {
            warn!(worker_id, "exit receiver dropped, report lost");
        }
    }
}

/// Fresh worker id.
pub fn new_worker_id() -> String {
    format!("w-{}", Uuid::now_v7())
}

/// Arm the wall-clock timeout for one worker.
fn arm_timeout(killer: ProcessKiller, worker_id: &str, timeout_ms: u64) -> JoinHandle<()> {
    let worker_id = worker_id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
        warn!(worker_id, timeout_ms, "task timeout fired");
        killer.kill(KillReason::Timeout);
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_kernel::{Config, TaskPriority};
    use overseer_store::new_task;

    fn test_pool(
        hard_cap: usize,
    ) -> (
        Arc<WorkerPool>,
        mpsc::UnboundedReceiver<WorkerExit>,
        tempfile::TempDir,
    ) {
        let config = Config {
            max_workers: hard_cap,
            ..Config::from_env()
        };
        let autoscaler = Autoscaler::new(&config);
        let supervisor = ProcessSupervisor::new(
            vec!["sh".into(), "-c".into()],
            Duration::from_millis(200),
        );
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            supervisor,
            autoscaler,
            WorkerGauge::new(),
            exit_tx,
            60_000,
        );
        (pool, exit_rx, tempfile::tempdir().unwrap())
    }

    fn capture_in(dir: &tempfile::TempDir, task_id: &str) -> Arc<OutputCapture> {
        Arc::new(OutputCapture::new(task_id, 1 << 20, dir.path()))
    }

    #[tokio::test]
    async fn spawn_runs_and_reports_exit() {
        let (pool, mut exit_rx, dir) = test_pool(2);
        let task = new_task("echo hi", TaskPriority::P1);

        pool.spawn(&task, &task.prompt, "w-1", capture_in(&dir, &task.id))
            .await
            .unwrap();
        assert_eq!(pool.worker_count(), 1);

        let exit = exit_rx.recv().await.unwrap();
        assert_eq!(exit.worker_id, "w-1");
        assert_eq!(exit.task_id, task.id);
        assert_eq!(exit.class, ExitClass::Completed);
        assert_eq!(exit.exit_code, Some(0));
        assert_eq!(pool.worker_count(), 0);
    }

    #[tokio::test]
    async fn cap_rejects_spawn_with_resource_exhausted() {
        let (pool, mut exit_rx, dir) = test_pool(1);
        let long = new_task("sleep 10", TaskPriority::P1);
        pool.spawn(&long, &long.prompt, "w-1", capture_in(&dir, &long.id))
            .await
            .unwrap();

        let second = new_task("echo nope", TaskPriority::P1);
        let err = pool
            .spawn(&second, &second.prompt, "w-2", capture_in(&dir, &second.id))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), overseer_kernel::ErrorKind::ResourceExhausted);

        pool.kill("w-1", KillReason::Cancel);
        let exit = exit_rx.recv().await.unwrap();
        assert_eq!(exit.class, ExitClass::Cancelled);
    }

    #[tokio::test]
    async fn timeout_fires_and_classifies_timed_out() {
        let (pool, mut exit_rx, dir) = test_pool(2);
        let mut task = new_task("sleep 30", TaskPriority::P1);
        task.timeout_ms = Some(300);

        pool.spawn(&task, &task.prompt, "w-1", capture_in(&dir, &task.id))
            .await
            .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), exit_rx.recv())
            .await
            .expect("timeout should kill the worker")
            .unwrap();
        assert_eq!(exit.class, ExitClass::TimedOut);
        assert_eq!(pool.worker_count(), 0);
    }

    #[tokio::test]
    async fn kill_task_finds_the_worker_by_task_id() {
        let (pool, mut exit_rx, dir) = test_pool(2);
        let task = new_task("sleep 30", TaskPriority::P1);

        pool.spawn(&task, &task.prompt, "w-1", capture_in(&dir, &task.id))
            .await
            .unwrap();

        assert!(pool.kill_task(&task.id, KillReason::Cancel));
        assert!(!pool.kill_task("ghost", KillReason::Cancel));

        let exit = exit_rx.recv().await.unwrap();
        assert_eq!(exit.class, ExitClass::Cancelled);
    }

    #[tokio::test]
    async fn capture_for_exposes_live_output() {
        let (pool, mut exit_rx, dir) = test_pool(2);
        let task = new_task("echo live; sleep 2", TaskPriority::P1);

        pool.spawn(&task, &task.prompt, "w-1", capture_in(&dir, &task.id))
            .await
            .unwrap();

        // Wait for the first line to land.
        let capture = pool.capture_for(&task.id).expect("running task has a capture");
        let mut seen = false;
        for _ in 0..50 {
            if capture.snapshot().stdout == vec!["live"] {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(seen, "expected live stdout before exit");

        pool.kill_task(&task.id, KillReason::Cancel);
        exit_rx.recv().await.unwrap();
        assert!(pool.capture_for(&task.id).is_none());
    }

    #[tokio::test]
    async fn kill_all_drains_the_pool() {
        let (pool, mut exit_rx, dir) = test_pool(4);
        for i in 0..3 {
            let task = new_task("sleep 30", TaskPriority::P1);
            pool.spawn(
                &task,
                &task.prompt,
                &format!("w-{i}"),
                capture_in(&dir, &task.id),
            )
            .await
            .unwrap();
        }
        assert_eq!(pool.worker_count(), 3);

        pool.kill_all(Duration::from_secs(2)).await;
        assert_eq!(pool.worker_count(), 0);

        for _ in 0..3 {
            let exit = exit_rx.recv().await.unwrap();
            assert_eq!(exit.class, ExitClass::Cancelled);
        }
    }
}
