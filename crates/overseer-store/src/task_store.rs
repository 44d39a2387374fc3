//! Task persistence.
//!
//! The task row is the authoritative lifecycle record: every status
//! transition is written here before the corresponding event is emitted.
//! Creation with prerequisites runs in a single transaction together
//! with edge insertion and the cycle check, so a rejected dependency
//! leaves no partial rows behind.

use chrono::Utc;
use overseer_kernel::{TaskPriority, TaskStatus};
use rusqlite::Row;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::dependency_store;
use crate::error::{StoreError, StoreResult};
use crate::model::Task;

const TASK_COLUMNS: &str = "id, prompt, priority, status, working_directory, use_worktree, \
     timeout_ms, max_output_buffer, session_id, worker_id, exit_code, \
     created_at, started_at, completed_at";

/// CRUD and transition operations on task rows.
#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert a task by id.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn save_task(&self, task: &Task) -> StoreResult<()> {
        let task = task.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, prompt, priority, status, working_directory, use_worktree, \
                     timeout_ms, max_output_buffer, session_id, worker_id, exit_code, created_at, started_at, completed_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
                     ON CONFLICT(id) DO UPDATE SET \
                     prompt = excluded.prompt, priority = excluded.priority, status = excluded.status, \
                     working_directory = excluded.working_directory, use_worktree = excluded.use_worktree, \
                     timeout_ms = excluded.timeout_ms, max_output_buffer = excluded.max_output_buffer, \
                     session_id = excluded.session_id, worker_id = excluded.worker_id, \
                     exit_code = excluded.exit_code, started_at = excluded.started_at, \
                     completed_at = excluded.completed_at",
                    rusqlite::params![
                        task.id,
                        task.prompt,
                        task.priority.as_str(),
                        task.status.as_str(),
                        task.working_directory,
                        task.use_worktree,
                        task.timeout_ms,
                        task.max_output_buffer,
                        task.session_id,
                        task.worker_id,
                        task.exit_code,
                        task.created_at,
                        task.started_at,
                        task.completed_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        debug!("task saved");
        Ok(())
    }

    /// Persist a new task together with its prerequisite edges.
    ///
    /// Runs in one transaction: prerequisite existence, self-edge, and
    /// cycle checks all happen before anything is committed.  The task's
    /// status is set to BLOCKED when any prerequisite is not yet
    /// COMPLETED, else kept QUEUED.  Returns the persisted task.
    #[instrument(skip(self, task, prerequisites), fields(task_id = %task.id))]
    pub async fn create_with_dependencies(
        &self,
        task: &Task,
        prerequisites: &[String],
    ) -> StoreResult<Task> {
        let mut task = task.clone();
        let prerequisites = prerequisites.to_vec();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;

                tx.execute(
                    "INSERT INTO tasks (id, prompt, priority, status, working_directory, use_worktree, \
                     timeout_ms, max_output_buffer, session_id, worker_id, exit_code, created_at, started_at, completed_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    rusqlite::params![
                        task.id,
                        task.prompt,
                        task.priority.as_str(),
                        TaskStatus::Queued.as_str(),
                        task.working_directory,
                        task.use_worktree,
                        task.timeout_ms,
                        task.max_output_buffer,
                        task.session_id,
                        task.worker_id,
                        task.exit_code,
                        task.created_at,
                        task.started_at,
                        task.completed_at,
                    ],
                )?;

                for prereq in &prerequisites {
                    dependency_store::insert_edge_tx(&tx, &task.id, prereq)?;
                }

                let blocked = dependency_store::is_blocked_tx(&tx, &task.id)?;
                let status = if blocked {
                    TaskStatus::Blocked
                } else {
                    TaskStatus::Queued
                };
                tx.execute(
                    "UPDATE tasks SET status = ?2 WHERE id = ?1",
                    rusqlite::params![task.id, status.as_str()],
                )?;

                tx.commit()?;
                task.status = status;
                Ok(task)
            })
            .await
    }

    /// Fetch a single task by id, returning `None` if not found.
    #[instrument(skip(self))]
    pub async fn find_task_by_id(&self, id: &str) -> StoreResult<Option<Task>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                    rusqlite::params![id],
                    map_task_row,
                );
                match result {
                    Ok(row) => row.into_task().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// List tasks with a given status, oldest first.
    #[instrument(skip(self))]
    pub async fn find_tasks_by_status(&self, status: TaskStatus) -> StoreResult<Vec<Task>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at ASC, id ASC"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![status.as_str()], map_task_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(TaskRow::into_task).collect()
            })
            .await
    }

    /// List every task, oldest first.
    #[instrument(skip(self))]
    pub async fn find_all_tasks(&self) -> StoreResult<Vec<Task>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC, id ASC"
                ))?;
                let rows = stmt
                    .query_map([], map_task_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(TaskRow::into_task).collect()
            })
            .await
    }

    /// Update only the status column.
    #[instrument(skip(self))]
    pub async fn set_status(&self, id: &str, status: TaskStatus) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE tasks SET status = ?2 WHERE id = ?1",
                    rusqlite::params![id, status.as_str()],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound { entity: "task", id });
                }
                Ok(())
            })
            .await
    }

    /// Compare-and-set on the status column.
    ///
    /// Returns whether the row actually moved — false means another
    /// transition won the race (or the task is gone), and the caller
    /// must not act as if its transition happened.
    #[instrument(skip(self))]
    pub async fn transition_status(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
    ) -> StoreResult<bool> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE tasks SET status = ?3 WHERE id = ?1 AND status = ?2",
                    rusqlite::params![id, from.as_str(), to.as_str()],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    /// Transition QUEUED → RUNNING: status, worker id, start time.
    ///
    /// Conditional on the row still being QUEUED; returns whether the
    /// transition happened.  A task cancelled between dequeue and
    /// dispatch stays cancelled and the caller drops it.
    #[instrument(skip(self))]
    pub async fn mark_running(
        &self,
        id: &str,
        worker_id: &str,
        started_at: i64,
    ) -> StoreResult<bool> {
        let id = id.to_string();
        let worker_id = worker_id.to_string();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE tasks SET status = 'running', worker_id = ?2, started_at = ?3 \
                     WHERE id = ?1 AND status = 'queued'",
                    rusqlite::params![id, worker_id, started_at],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    /// Transition into a terminal status with exit metadata.
    #[instrument(skip(self))]
    pub async fn mark_terminal(
        &self,
        id: &str,
        status: TaskStatus,
        exit_code: Option<i32>,
        completed_at: i64,
    ) -> StoreResult<()> {
        debug_assert!(status.is_terminal());
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE tasks SET status = ?2, exit_code = ?3, completed_at = ?4 WHERE id = ?1",
                    rusqlite::params![id, status.as_str(), exit_code, completed_at],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound { entity: "task", id });
                }
                Ok(())
            })
            .await
    }

    /// Propagate a continuation token onto a task that has none.
    #[instrument(skip(self))]
    pub async fn inherit_session(&self, id: &str, session_id: &str) -> StoreResult<()> {
        let id = id.to_string();
        let session_id = session_id.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE tasks SET session_id = ?2 WHERE id = ?1 AND session_id IS NULL",
                    rusqlite::params![id, session_id],
                )?;
                Ok(())
            })
            .await
    }

    /// Startup reconciliation: any task left RUNNING by a previous
    /// process is re-marked QUEUED (its worker is gone) and returned so
    /// the daemon can re-enqueue it.
    #[instrument(skip(self))]
    pub async fn requeue_orphaned_running(&self) -> StoreResult<Vec<Task>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'running' ORDER BY created_at ASC"
                ))?;
                let rows = stmt
                    .query_map([], map_task_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                let mut orphans = rows
                    .into_iter()
                    .map(TaskRow::into_task)
                    .collect::<StoreResult<Vec<Task>>>()?;

                conn.execute(
                    "UPDATE tasks SET status = 'queued', worker_id = NULL, started_at = NULL \
                     WHERE status = 'running'",
                    [],
                )?;
                for task in &mut orphans {
                    task.status = TaskStatus::Queued;
                    task.worker_id = None;
                    task.started_at = None;
                }
                Ok(orphans)
            })
            .await
    }

    /// Delete a task; outputs, checkpoints, and outgoing edges cascade.
    #[instrument(skip(self))]
    pub async fn delete_task(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let deleted =
                    conn.execute("DELETE FROM tasks WHERE id = ?1", rusqlite::params![id])?;
                if deleted == 0 {
                    return Err(StoreError::NotFound { entity: "task", id });
                }
                Ok(())
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

/// Raw row data before enum parsing.
///
/// Keeps the `rusqlite` row-mapping closure infallible on our side; the
/// enum parsing happens in a second step where a bad value can surface
/// as [`StoreError::CorruptRow`].
pub(crate) struct TaskRow {
    id: String,
    prompt: String,
    priority: String,
    status: String,
    working_directory: Option<String>,
    use_worktree: bool,
    timeout_ms: Option<u64>,
    max_output_buffer: Option<u64>,
    session_id: Option<String>,
    worker_id: Option<String>,
    exit_code: Option<i32>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

pub(crate) fn map_task_row(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        prompt: row.get(1)?,
        priority: row.get(2)?,
        status: row.get(3)?,
        working_directory: row.get(4)?,
        use_worktree: row.get(5)?,
        timeout_ms: row.get(6)?,
        max_output_buffer: row.get(7)?,
        session_id: row.get(8)?,
        worker_id: row.get(9)?,
        exit_code: row.get(10)?,
        created_at: row.get(11)?,
        started_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}

impl TaskRow {
    pub(crate) fn into_task(self) -> StoreResult<Task> {
        let priority =
            TaskPriority::parse(&self.priority).ok_or_else(|| StoreError::CorruptRow {
                entity: "tasks",
                message: format!("unknown priority `{}`", self.priority),
            })?;
        let status = TaskStatus::parse(&self.status).ok_or_else(|| StoreError::CorruptRow {
            entity: "tasks",
            message: format!("unknown status `{}`", self.status),
        })?;
        Ok(Task {
            id: self.id,
            prompt: self.prompt,
            priority,
            status,
            working_directory: self.working_directory,
            use_worktree: self.use_worktree,
            timeout_ms: self.timeout_ms,
            max_output_buffer: self.max_output_buffer,
            session_id: self.session_id,
            worker_id: self.worker_id,
            exit_code: self.exit_code,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

/// Convenience used by tests and the engine to build a fresh QUEUED task.
pub fn new_task(prompt: impl Into<String>, priority: TaskPriority) -> Task {
    Task {
        id: uuid::Uuid::now_v7().to_string(),
        prompt: prompt.into(),
        priority,
        status: TaskStatus::Queued,
        working_directory: None,
        use_worktree: false,
        timeout_ms: None,
        max_output_buffer: None,
        session_id: None,
        worker_id: None,
        exit_code: None,
        created_at: Utc::now().timestamp_millis(),
        started_at: None,
        completed_at: None,
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> TaskStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        TaskStore::new(db)
    }

    #[tokio::test]
    async fn save_and_find_round_trip_with_all_fields() {
        let store = setup().await;
        let mut task = new_task("echo hello", TaskPriority::P0);
        task.working_directory = Some("/tmp".into());
        task.use_worktree = true;
        task.timeout_ms = Some(5_000);
        task.max_output_buffer = Some(4_096);
        task.session_id = Some("sess-1".into());
        task.worker_id = Some("w-1".into());
        task.exit_code = Some(0);
        task.started_at = Some(task.created_at + 1);
        task.completed_at = Some(task.created_at + 2);

        store.save_task(&task).await.unwrap();
        let loaded = store.find_task_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded, task);
    }

    #[tokio::test]
    async fn round_trip_with_optionals_absent() {
        let store = setup().await;
        let task = new_task("sleep 1", TaskPriority::P2);
        store.save_task(&task).await.unwrap();
        let loaded = store.find_task_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded, task);
        assert!(loaded.worker_id.is_none());
        assert!(loaded.exit_code.is_none());
    }

    #[tokio::test]
    async fn find_missing_returns_none() {
        let store = setup().await;
        assert!(store.find_task_by_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_task_is_an_upsert() {
        let store = setup().await;
        let mut task = new_task("echo", TaskPriority::P1);
        store.save_task(&task).await.unwrap();

        task.status = TaskStatus::Running;
        task.worker_id = Some("w-9".into());
        store.save_task(&task).await.unwrap();

        let loaded = store.find_task_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert_eq!(loaded.worker_id.as_deref(), Some("w-9"));
    }

    #[tokio::test]
    async fn find_by_status_orders_by_creation() {
        let store = setup().await;
        let mut first = new_task("one", TaskPriority::P1);
        first.created_at = 100;
        let mut second = new_task("two", TaskPriority::P1);
        second.created_at = 200;
        store.save_task(&second).await.unwrap();
        store.save_task(&first).await.unwrap();

        let queued = store.find_tasks_by_status(TaskStatus::Queued).await.unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].id, first.id);
        assert_eq!(queued[1].id, second.id);
    }

    #[tokio::test]
    async fn mark_running_and_terminal() {
        let store = setup().await;
        let task = new_task("echo", TaskPriority::P1);
        store.save_task(&task).await.unwrap();

        assert!(store.mark_running(&task.id, "w-1", 123).await.unwrap());
        let running = store.find_task_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert_eq!(running.worker_id.as_deref(), Some("w-1"));
        assert_eq!(running.started_at, Some(123));

        store
            .mark_terminal(&task.id, TaskStatus::Completed, Some(0), 456)
            .await
            .unwrap();
        let done = store.find_task_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.completed_at, Some(456));
    }

    #[tokio::test]
    async fn mark_running_is_conditional_on_queued() {
        let store = setup().await;
        assert!(!store.mark_running("ghost", "w-1", 1).await.unwrap());

        let task = new_task("echo", TaskPriority::P1);
        store.save_task(&task).await.unwrap();
        store
            .mark_terminal(&task.id, TaskStatus::Cancelled, None, 9)
            .await
            .unwrap();
        // A cancelled task cannot be resurrected into RUNNING.
        assert!(!store.mark_running(&task.id, "w-1", 10).await.unwrap());
        let loaded = store.find_task_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn transition_status_compare_and_set() {
        let store = setup().await;
        let task = new_task("echo", TaskPriority::P1);
        store.save_task(&task).await.unwrap();

        assert!(store
            .transition_status(&task.id, TaskStatus::Queued, TaskStatus::Blocked)
            .await
            .unwrap());
        // Stale expectation loses.
        assert!(!store
            .transition_status(&task.id, TaskStatus::Queued, TaskStatus::Cancelled)
            .await
            .unwrap());
        let loaded = store.find_task_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn requeue_orphaned_running_resets_worker_fields() {
        let store = setup().await;
        let task = new_task("echo", TaskPriority::P1);
        store.save_task(&task).await.unwrap();
        store.mark_running(&task.id, "w-dead", 50).await.unwrap();

        let orphans = store.requeue_orphaned_running().await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].status, TaskStatus::Queued);

        let loaded = store.find_task_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Queued);
        assert!(loaded.worker_id.is_none());
        assert!(loaded.started_at.is_none());
    }

    #[tokio::test]
    async fn inherit_session_only_fills_empty() {
        let store = setup().await;
        let task = new_task("echo", TaskPriority::P1);
        store.save_task(&task).await.unwrap();

        store.inherit_session(&task.id, "sess-a").await.unwrap();
        store.inherit_session(&task.id, "sess-b").await.unwrap();

        let loaded = store.find_task_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.session_id.as_deref(), Some("sess-a"));
    }
}
