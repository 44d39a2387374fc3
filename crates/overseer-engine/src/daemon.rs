//! Daemon assembly.
//!
//! Boot order: config → store (open + migrate) → reconcile → kernel
//! services (bus, queue, monitor, autoscaler) → pool and manager →
//! handler registration → cron executor → re-admission of reconciled
//! tasks.  Shutdown reverses it: stop the tickers, drain the workers,
//! stop the exit loop, drop the store.
//!
//! Recovery is at-least-once: tasks left RUNNING by a dead process are
//! re-marked QUEUED and re-admitted; handlers are idempotent, so a task
//! that also still sits in a stale queue row converges to one run.

use std::sync::Arc;

use overseer_kernel::{
    Autoscaler, Config, EventBus, EventPayload, PriorityQueue, ResourceMonitor, TaskError,
    TaskResult, WorkerGauge,
};
use overseer_store::{
    CheckpointStore, Database, DependencyStore, OutputStore, ScheduleStore, TaskStore,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointRecorder;
use crate::handlers::{
    register_all, DependencyHandler, QueueHandler, ScheduleHandler, WorkerHandler,
};
use crate::manager::TaskManager;
use crate::resolver::DependencyResolver;
use crate::supervisor::ProcessSupervisor;
use crate::worker::WorkerPool;
use overseer_cron::ScheduleExecutor;

/// The assembled, running daemon.
pub struct Daemon {
    config: Config,
    manager: Arc<TaskManager>,
    schedules: ScheduleStore,
    pool: Arc<WorkerPool>,
    monitor: ResourceMonitor,
    autoscaler: Arc<Autoscaler>,
    cron: ScheduleExecutor,
    monitor_handle: Option<JoinHandle<()>>,
    autoscaler_handle: Option<JoinHandle<()>>,
    exit_loop: JoinHandle<()>,
}

impl Daemon {
    /// Boot the daemon.
    pub async fn start(config: Config) -> TaskResult<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            TaskError::system(format!(
                "cannot create data directory {}: {e}",
                config.data_dir.display()
            ))
        })?;

        let db = Database::open_and_migrate(config.db_path()).await?;
        let tasks = TaskStore::new(db.clone());
        let outputs = OutputStore::new(db.clone());
        let schedules = ScheduleStore::new(db.clone());
        let resolver = DependencyResolver::new(DependencyStore::new(db.clone()));
        let checkpoints =
            CheckpointRecorder::new(CheckpointStore::new(db.clone()), resolver.clone());

        let bus = EventBus::new(config.request_timeout);
        let queue = Arc::new(PriorityQueue::new());
        let monitor = ResourceMonitor::new(&config);
        let gauge = WorkerGauge::new();
        let autoscaler = Autoscaler::new(&config);

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let supervisor =
            ProcessSupervisor::new(config.agent_command.clone(), config.kill_grace);
        let pool = WorkerPool::new(
            supervisor,
            Arc::clone(&autoscaler),
            gauge.clone(),
            exit_tx,
            config.task_timeout_ms,
        );

        let manager = TaskManager::new(
            config.clone(),
            bus.clone(),
            Arc::clone(&queue),
            Arc::clone(&pool),
            tasks.clone(),
            outputs.clone(),
            resolver.clone(),
            checkpoints,
        );

        register_all(
            &bus,
            QueueHandler::new(tasks.clone(), resolver.clone(), Arc::clone(&queue)),
            WorkerHandler::new(
                Arc::clone(&manager),
                tasks.clone(),
                monitor.clone(),
                Arc::clone(&autoscaler),
            ),
            DependencyHandler::new(resolver.clone()),
            ScheduleHandler::new(Arc::clone(&manager)),
        );

        // Prime the admission predicate before anything dispatches.
        monitor.sample_now().await;
        let monitor_handle = monitor.start();
        let autoscaler_handle =
            autoscaler.start(monitor.clone(), Arc::clone(&queue), gauge.clone());

        // Drain worker exits into the manager for the daemon's lifetime.
        let exit_manager = Arc::clone(&manager);
        let exit_loop = tokio::spawn(async move {
            while let Some(exit) = exit_rx.recv().await {
                if let Err(err) = exit_manager.on_worker_exit(exit).await {
                    error!(%err, "worker exit handling failed");
                }
            }
        });

        let mut cron = ScheduleExecutor::new(schedules.clone(), bus.clone(), config.misfire_cap);
        cron.start().map_err(TaskError::from)?;

        let daemon = Self {
            config,
            manager,
            schedules,
            pool,
            monitor,
            autoscaler,
            cron,
            monitor_handle,
            autoscaler_handle,
            exit_loop,
        };
        daemon.reconcile(&tasks, &bus).await?;

        info!("daemon started");
        Ok(daemon)
    }

    /// Startup reconciliation: re-admit work a previous process left
    /// behind.  Orphaned RUNNING rows become QUEUED again; every QUEUED
    /// row is re-announced so the queue handler can admit it.
    async fn reconcile(&self, tasks: &TaskStore, bus: &EventBus) -> TaskResult<()> {
        let orphans = tasks.requeue_orphaned_running().await?;
        if !orphans.is_empty() {
            warn!(count = orphans.len(), "re-queued tasks orphaned by a previous run");
        }

        let queued = tasks
            .find_tasks_by_status(overseer_kernel::TaskStatus::Queued)
            .await?;
        for task in queued {
            if let Err(err) = bus
                .emit(EventPayload::TaskPersisted {
                    task_id: task.id.clone(),
                })
                .await
            {
                error!(task_id = %task.id, %err, "re-admission failed");
            }
        }
        Ok(())
    }

    /// The public task façade.
    pub fn manager(&self) -> Arc<TaskManager> {
        Arc::clone(&self.manager)
    }

    /// The schedule store, for the CLI surface.
    pub fn schedules(&self) -> ScheduleStore {
        self.schedules.clone()
    }

    /// The effective configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ordered shutdown: stop the control loops, drain the workers,
    /// close the exit loop.  Returns when every live worker has
    /// reported exit or the grace window expired.
    pub async fn shutdown(mut self) {
        info!("daemon shutting down");

        self.autoscaler.stop();
        self.monitor.stop();
        self.cron.stop().await;
        // Both loops only notice the stop flag after their current
        // sleep; abort instead of waiting out the interval.
        if let Some(handle) = self.autoscaler_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.monitor_handle.take() {
            handle.abort();
        }

        self.pool.kill_all(self.config.kill_grace).await;

        // Give the exit loop a moment to finish persisting the terminal
        // transitions of the workers that just died, then stop it.
        let drained = tokio::time::timeout(self.config.kill_grace, async {
            while self.manager.worker_count() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("shutdown grace expired with workers still live");
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        self.exit_loop.abort();

        info!("daemon stopped");
    }
}
