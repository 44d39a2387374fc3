//! The prerequisite DAG.
//!
//! Edges are `(task_id, prerequisite_id)` pairs: the task may not run
//! until the prerequisite reaches COMPLETED.  Insertion validates both
//! endpoints, rejects self-edges, and runs a DFS cycle check **inside
//! the same transaction** as the insert so a concurrent insert cannot
//! slip a cycle past the check.

use std::collections::HashSet;

use rusqlite::Connection;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// Edge CRUD and blocked/resolve queries.
#[derive(Clone)]
pub struct DependencyStore {
    db: Database,
}

impl DependencyStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert the edge `task -> prerequisite`.
    ///
    /// Fails with `DependencyCycle` (and no store mutation) if the edge
    /// would close a cycle, `NotFound` if either endpoint is missing,
    /// and `InvalidArgument` for self-edges.  Inserting an existing edge
    /// is a no-op.
    #[instrument(skip(self))]
    pub async fn save_dependency(&self, task_id: &str, prerequisite_id: &str) -> StoreResult<()> {
        let task_id = task_id.to_string();
        let prerequisite_id = prerequisite_id.to_string();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                insert_edge_tx(&tx, &task_id, &prerequisite_id)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        debug!("dependency saved");
        Ok(())
    }

    /// True iff any prerequisite of `task_id` is not COMPLETED.
    #[instrument(skip(self))]
    pub async fn is_blocked(&self, task_id: &str) -> StoreResult<bool> {
        let task_id = task_id.to_string();
        self.db
            .execute(move |conn| is_blocked_tx(conn, &task_id))
            .await
    }

    /// Task ids that depend on `prerequisite_id`.
    #[instrument(skip(self))]
    pub async fn dependents_of(&self, prerequisite_id: &str) -> StoreResult<Vec<String>> {
        let prerequisite_id = prerequisite_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_id FROM dependencies WHERE prerequisite_id = ?1 ORDER BY created_at ASC",
                )?;
                let ids = stmt
                    .query_map(rusqlite::params![prerequisite_id], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(ids)
            })
            .await
    }

    /// Prerequisite ids of `task_id`.
    #[instrument(skip(self))]
    pub async fn prerequisites_of(&self, task_id: &str) -> StoreResult<Vec<String>> {
        let task_id = task_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT prerequisite_id FROM dependencies WHERE task_id = ?1 ORDER BY created_at ASC",
                )?;
                let ids = stmt
                    .query_map(rusqlite::params![task_id], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(ids)
            })
            .await
    }

    /// Called on terminal success of `prerequisite_id`: returns the
    /// dependents whose blocker sets just became empty (every one of
    /// their prerequisites is now COMPLETED).
    #[instrument(skip(self))]
    pub async fn resolve(&self, prerequisite_id: &str) -> StoreResult<Vec<String>> {
        let prerequisite_id = prerequisite_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT d.task_id FROM dependencies d \
                     WHERE d.prerequisite_id = ?1 \
                     AND NOT EXISTS ( \
                         SELECT 1 FROM dependencies d2 \
                         JOIN tasks p ON p.id = d2.prerequisite_id \
                         WHERE d2.task_id = d.task_id AND p.status != 'completed' \
                     ) \
                     ORDER BY d.created_at ASC",
                )?;
                let ids = stmt
                    .query_map(rusqlite::params![prerequisite_id], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(ids)
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Transaction-scoped helpers (shared with task creation)
// ═══════════════════════════════════════════════════════════════════════

/// Insert one edge inside an open transaction, with full validation.
pub(crate) fn insert_edge_tx(
    conn: &Connection,
    task_id: &str,
    prerequisite_id: &str,
) -> StoreResult<()> {
    if task_id == prerequisite_id {
        return Err(StoreError::InvalidArgument(format!(
            "task {task_id} cannot depend on itself"
        )));
    }
    for (entity, id) in [("task", task_id), ("task", prerequisite_id)] {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
            rusqlite::params![id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StoreError::NotFound {
                entity,
                id: id.to_string(),
            });
        }
    }

    if reaches(conn, prerequisite_id, task_id)? {
        return Err(StoreError::DependencyCycle {
            task_id: task_id.to_string(),
            prerequisite_id: prerequisite_id.to_string(),
        });
    }

    let now = chrono::Utc::now().timestamp_millis();
    conn.execute(
        "INSERT OR IGNORE INTO dependencies (task_id, prerequisite_id, created_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![task_id, prerequisite_id, now],
    )?;
    Ok(())
}

/// Blocked check usable inside an open transaction.
pub(crate) fn is_blocked_tx(conn: &Connection, task_id: &str) -> StoreResult<bool> {
    let blocked: bool = conn.query_row(
        "SELECT EXISTS( \
             SELECT 1 FROM dependencies d \
             JOIN tasks p ON p.id = d.prerequisite_id \
             WHERE d.task_id = ?1 AND p.status != 'completed')",
        rusqlite::params![task_id],
        |row| row.get(0),
    )?;
    Ok(blocked)
}

/// DFS over persisted edges: can `to` be reached from `from` by
/// following task -> prerequisite edges?
fn reaches(conn: &Connection, from: &str, to: &str) -> StoreResult<bool> {
    let mut stmt = conn.prepare("SELECT prerequisite_id FROM dependencies WHERE task_id = ?1")?;
    let mut visited: HashSet<String> = HashSet::new();
    let mut stack = vec![from.to_string()];

    while let Some(node) = stack.pop() {
        if node == to {
            return Ok(true);
        }
        if !visited.insert(node.clone()) {
            continue;
        }
        let next = stmt
            .query_map(rusqlite::params![node], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        stack.extend(next);
    }
    Ok(false)
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_store::{new_task, TaskStore};
    use overseer_kernel::{TaskPriority, TaskStatus};

    async fn setup() -> (TaskStore, DependencyStore) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        (TaskStore::new(db.clone()), DependencyStore::new(db))
    }

    async fn saved_task(tasks: &TaskStore, prompt: &str) -> String {
        let task = new_task(prompt, TaskPriority::P1);
        tasks.save_task(&task).await.unwrap();
        task.id
    }

    #[tokio::test]
    async fn edge_round_trip() {
        let (tasks, deps) = setup().await;
        let a = saved_task(&tasks, "a").await;
        let b = saved_task(&tasks, "b").await;

        deps.save_dependency(&b, &a).await.unwrap();
        assert_eq!(deps.prerequisites_of(&b).await.unwrap(), vec![a.clone()]);
        assert_eq!(deps.dependents_of(&a).await.unwrap(), vec![b.clone()]);
    }

    #[tokio::test]
    async fn self_edge_is_rejected() {
        let (tasks, deps) = setup().await;
        let a = saved_task(&tasks, "a").await;
        let err = deps.save_dependency(&a, &a).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn missing_endpoint_is_not_found() {
        let (tasks, deps) = setup().await;
        let a = saved_task(&tasks, "a").await;
        let err = deps.save_dependency(&a, "ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn direct_cycle_is_rejected_without_mutation() {
        let (tasks, deps) = setup().await;
        let a = saved_task(&tasks, "a").await;
        let b = saved_task(&tasks, "b").await;

        deps.save_dependency(&b, &a).await.unwrap();
        let err = deps.save_dependency(&a, &b).await.unwrap_err();
        assert!(matches!(err, StoreError::DependencyCycle { .. }));

        // The rejected edge left no row behind.
        assert!(deps.prerequisites_of(&a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transitive_cycle_is_rejected() {
        let (tasks, deps) = setup().await;
        let a = saved_task(&tasks, "a").await;
        let b = saved_task(&tasks, "b").await;
        let c = saved_task(&tasks, "c").await;

        // c -> b -> a; closing a -> c would cycle.
        deps.save_dependency(&b, &a).await.unwrap();
        deps.save_dependency(&c, &b).await.unwrap();
        let err = deps.save_dependency(&a, &c).await.unwrap_err();
        assert!(matches!(err, StoreError::DependencyCycle { .. }));
    }

    #[tokio::test]
    async fn diamond_is_not_a_cycle() {
        let (tasks, deps) = setup().await;
        let root = saved_task(&tasks, "root").await;
        let left = saved_task(&tasks, "left").await;
        let right = saved_task(&tasks, "right").await;
        let sink = saved_task(&tasks, "sink").await;

        deps.save_dependency(&left, &root).await.unwrap();
        deps.save_dependency(&right, &root).await.unwrap();
        deps.save_dependency(&sink, &left).await.unwrap();
        deps.save_dependency(&sink, &right).await.unwrap();

        assert_eq!(deps.prerequisites_of(&sink).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn blocked_tracks_prerequisite_status() {
        let (tasks, deps) = setup().await;
        let a = saved_task(&tasks, "a").await;
        let b = saved_task(&tasks, "b").await;
        deps.save_dependency(&b, &a).await.unwrap();

        assert!(deps.is_blocked(&b).await.unwrap());
        assert!(!deps.is_blocked(&a).await.unwrap());

        tasks
            .mark_terminal(&a, TaskStatus::Completed, Some(0), 1)
            .await
            .unwrap();
        assert!(!deps.is_blocked(&b).await.unwrap());
    }

    #[tokio::test]
    async fn failed_prerequisite_keeps_dependent_blocked() {
        let (tasks, deps) = setup().await;
        let a = saved_task(&tasks, "a").await;
        let b = saved_task(&tasks, "b").await;
        deps.save_dependency(&b, &a).await.unwrap();

        tasks
            .mark_terminal(&a, TaskStatus::Failed, Some(1), 1)
            .await
            .unwrap();
        assert!(deps.is_blocked(&b).await.unwrap());
    }

    #[tokio::test]
    async fn resolve_returns_only_fully_unblocked_dependents() {
        let (tasks, deps) = setup().await;
        let a = saved_task(&tasks, "a").await;
        let b = saved_task(&tasks, "b").await;
        let single = saved_task(&tasks, "single").await;
        let double = saved_task(&tasks, "double").await;

        deps.save_dependency(&single, &a).await.unwrap();
        deps.save_dependency(&double, &a).await.unwrap();
        deps.save_dependency(&double, &b).await.unwrap();

        tasks
            .mark_terminal(&a, TaskStatus::Completed, Some(0), 1)
            .await
            .unwrap();

        // `single` lost its last blocker; `double` still waits on b.
        assert_eq!(deps.resolve(&a).await.unwrap(), vec![single.clone()]);

        tasks
            .mark_terminal(&b, TaskStatus::Completed, Some(0), 2)
            .await
            .unwrap();
        assert_eq!(deps.resolve(&b).await.unwrap(), vec![double.clone()]);
    }
}
