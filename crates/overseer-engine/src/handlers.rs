//! Orchestration event handlers.
//!
//! Four glue subscribers translate bus events into state transitions:
//!
//! - [`QueueHandler`] — admission into the priority queue, plus the
//!   responder side of `NextTaskQuery` / `RequeueTask`.
//! - [`WorkerHandler`] — the dispatcher: drains the queue into workers
//!   whenever capacity frees up, subject to admission.
//! - [`DependencyHandler`] — turns terminal success into `TaskUnblocked`
//!   events for freshly unblocked dependents.
//! - [`ScheduleHandler`] — turns `ScheduleDue` into a fresh delegation.
//!
//! Handlers are idempotent: each re-reads authoritative state from the
//! store before acting, so replays and races degrade to no-ops.

use std::sync::Arc;

use async_trait::async_trait;
use overseer_kernel::{
    Autoscaler, Event, EventBus, EventHandler, EventKind, EventPayload, PriorityQueue,
    ResourceMonitor, ResponseValue, TaskResult, TaskStatus,
};
use overseer_kernel::queue::QueuedTask;
use overseer_store::TaskStore;
use tracing::{debug, warn};

use crate::manager::{DelegateSpec, TaskManager};
use crate::resolver::DependencyResolver;

/// Register all four handlers in their canonical order.
pub fn register_all(
    bus: &EventBus,
    queue_handler: Arc<QueueHandler>,
    worker_handler: Arc<WorkerHandler>,
    dependency_handler: Arc<DependencyHandler>,
    schedule_handler: Arc<ScheduleHandler>,
) {
    bus.subscribe(EventKind::TaskPersisted, queue_handler.clone());
    bus.subscribe(EventKind::TaskUnblocked, queue_handler.clone());
    bus.subscribe(EventKind::NextTaskQuery, queue_handler.clone());
    bus.subscribe(EventKind::RequeueTask, queue_handler);

    bus.subscribe(EventKind::TaskQueued, worker_handler.clone());
    bus.subscribe(EventKind::TaskCompleted, worker_handler.clone());
    bus.subscribe(EventKind::TaskFailed, worker_handler.clone());
    bus.subscribe(EventKind::TaskCancelled, worker_handler);

    bus.subscribe(EventKind::TaskCompleted, dependency_handler);

    bus.subscribe(EventKind::ScheduleDue, schedule_handler);
}

// ---------------------------------------------------------------------------
// Queue handler
// ---------------------------------------------------------------------------

/// Owns admission into the runnable set.
pub struct QueueHandler {
    tasks: TaskStore,
    resolver: DependencyResolver,
    queue: Arc<PriorityQueue>,
}

impl QueueHandler {
    pub fn new(tasks: TaskStore, resolver: DependencyResolver, queue: Arc<PriorityQueue>) -> Arc<Self> {
        Arc::new(Self {
            tasks,
            resolver,
            queue,
        })
    }

    /// Enqueue a task that is QUEUED and unblocked, then announce it.
    async fn admit(&self, task_id: &str, bus: &EventBus) -> TaskResult<()> {
        let Some(task) = self.tasks.find_task_by_id(task_id).await? else {
            debug!(task_id, "admission for unknown task dropped");
            return Ok(());
        };
        if task.status != TaskStatus::Queued {
            debug!(task_id, status = %task.status, "not queued, admission skipped");
            return Ok(());
        }
        if self.resolver.is_blocked(task_id).await? {
            debug!(task_id, "still blocked, admission skipped");
            return Ok(());
        }
        if self.queue.contains(task_id) {
            return Ok(());
        }
        self.queue.enqueue(QueuedTask {
            task_id: task.id.clone(),
            priority: task.priority,
            created_at: task.created_at,
        });
        debug!(task_id, "task enqueued");
        bus.emit(EventPayload::TaskQueued {
            task_id: task.id.clone(),
        })
        .await
    }

    /// The `TaskUnblocked` race: the task may have been cancelled (or
    /// even dispatched) between the unblock emission and this handler
    /// running, so re-read the authoritative row first.
    async fn on_unblocked(&self, task_id: &str, bus: &EventBus) -> TaskResult<()> {
        let Some(task) = self.tasks.find_task_by_id(task_id).await? else {
            return Ok(());
        };
        match task.status {
            TaskStatus::Blocked => {
                if self.resolver.is_blocked(task_id).await? {
                    // Another prerequisite is still open.
                    return Ok(());
                }
                // Compare-and-set: a cancel racing this handler must not
                // be overwritten back to QUEUED.
                if !self
                    .tasks
                    .transition_status(task_id, TaskStatus::Blocked, TaskStatus::Queued)
                    .await?
                {
                    debug!(task_id, "unblock lost a status race, dropping");
                    return Ok(());
                }
                self.admit(task_id, bus).await
            }
            TaskStatus::Queued => self.admit(task_id, bus).await,
            status => {
                debug!(task_id, %status, "unblock event dropped, task moved on");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl EventHandler for QueueHandler {
    fn name(&self) -> &'static str {
        "queue-handler"
    }

    async fn handle(&self, event: &Event, bus: &EventBus) -> TaskResult<()> {
        match &event.payload {
            EventPayload::TaskPersisted { task_id } => self.admit(task_id, bus).await,
            EventPayload::TaskUnblocked { task_id, .. } => self.on_unblocked(task_id, bus).await,
            EventPayload::NextTaskQuery => {
                if let Some(correlation_id) = event.correlation_id {
                    let head = self.queue.dequeue().map(|entry| entry.task_id);
                    bus.respond(correlation_id, ResponseValue::NextTask(head));
                }
                Ok(())
            }
            EventPayload::RequeueTask { task_id } => {
                let result = self.admit(task_id, bus).await;
                if let Some(correlation_id) = event.correlation_id {
                    bus.respond(correlation_id, ResponseValue::Ack);
                }
                result
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker handler (the dispatcher)
// ---------------------------------------------------------------------------

/// Moves tasks from QUEUED to RUNNING while admission allows.
pub struct WorkerHandler {
    manager: Arc<TaskManager>,
    tasks: TaskStore,
    monitor: ResourceMonitor,
    autoscaler: Arc<Autoscaler>,
}

impl WorkerHandler {
    pub fn new(
        manager: Arc<TaskManager>,
        tasks: TaskStore,
        monitor: ResourceMonitor,
        autoscaler: Arc<Autoscaler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            tasks,
            monitor,
            autoscaler,
        })
    }

    /// Dispatch loop: admit workers until the cap, the monitor, or the
    /// queue stops us.
    async fn dispatch_available(&self, bus: &EventBus) -> TaskResult<()> {
        loop {
            let live = self.manager.worker_count();
            if live >= self.autoscaler.current_cap() {
                debug!(live, cap = self.autoscaler.current_cap(), "dispatch paused at cap");
                return Ok(());
            }
            if !self.monitor.can_spawn_worker(live) {
                debug!(live, "dispatch paused by admission predicate");
                return Ok(());
            }

            let response = bus.request(EventPayload::NextTaskQuery).await?;
            let ResponseValue::NextTask(Some(task_id)) = response else {
                return Ok(());
            };

            let Some(task) = self.tasks.find_task_by_id(&task_id).await? else {
                warn!(task_id, "dequeued task no longer exists");
                continue;
            };
            if task.status != TaskStatus::Queued {
                // Cancelled (or otherwise moved on) while queued.
                debug!(task_id, status = %task.status, "dequeued task skipped");
                continue;
            }

            self.manager.start_task(&task).await?;
        }
    }
}

#[async_trait]
impl EventHandler for WorkerHandler {
    fn name(&self) -> &'static str {
        "worker-handler"
    }

    async fn handle(&self, event: &Event, bus: &EventBus) -> TaskResult<()> {
        match event.kind() {
            EventKind::TaskQueued
            | EventKind::TaskCompleted
            | EventKind::TaskFailed
            | EventKind::TaskCancelled => self.dispatch_available(bus).await,
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Dependency handler
// ---------------------------------------------------------------------------

/// Resolves dependents when a prerequisite completes.
pub struct DependencyHandler {
    resolver: DependencyResolver,
}

impl DependencyHandler {
    pub fn new(resolver: DependencyResolver) -> Arc<Self> {
        Arc::new(Self { resolver })
    }
}

#[async_trait]
impl EventHandler for DependencyHandler {
    fn name(&self) -> &'static str {
        "dependency-handler"
    }

    async fn handle(&self, event: &Event, bus: &EventBus) -> TaskResult<()> {
        let EventPayload::TaskCompleted { task_id, .. } = &event.payload else {
            return Ok(());
        };
        let unblocked = self.resolver.resolve(task_id).await?;
        for dependent in unblocked {
            debug!(prerequisite = %task_id, task_id = %dependent, "dependent unblocked");
            bus.emit(EventPayload::TaskUnblocked {
                task_id: dependent,
                prerequisite_id: task_id.clone(),
            })
            .await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Schedule handler
// ---------------------------------------------------------------------------

/// Turns a due schedule into a fresh delegation.
pub struct ScheduleHandler {
    manager: Arc<TaskManager>,
}

impl ScheduleHandler {
    pub fn new(manager: Arc<TaskManager>) -> Arc<Self> {
        Arc::new(Self { manager })
    }
}

#[async_trait]
impl EventHandler for ScheduleHandler {
    fn name(&self) -> &'static str {
        "schedule-handler"
    }

    async fn handle(&self, event: &Event, _bus: &EventBus) -> TaskResult<()> {
        let EventPayload::ScheduleDue {
            schedule_id,
            prompt,
            priority,
        } = &event.payload
        else {
            return Ok(());
        };
        let task = self
            .manager
            .delegate(DelegateSpec {
                prompt: prompt.clone(),
                priority: Some(*priority),
                ..DelegateSpec::default()
            })
            .await?;
        debug!(schedule_id = %schedule_id, task_id = %task.id, "scheduled delegation created");
        Ok(())
    }
}
