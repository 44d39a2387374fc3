//! Dependency-graph façade.
//!
//! Thin orchestration-facing wrapper over the persisted edge table:
//! validates and inserts edges (cycle check runs inside the store
//! transaction), answers blocked queries, and computes the dependents
//! that a terminal-success transition just unblocked.

use overseer_kernel::TaskResult;
use overseer_store::DependencyStore;

#[derive(Clone)]
pub struct DependencyResolver {
    deps: DependencyStore,
}

impl DependencyResolver {
    pub fn new(deps: DependencyStore) -> Self {
        Self { deps }
    }

    /// Add `prerequisite` as a blocker of `task`.
    ///
    /// Rejects missing endpoints (`NOT_FOUND`), self-edges
    /// (`INVALID_INPUT`), and cycles (`DEPENDENCY_CYCLE`, checked in the
    /// same transaction as the insert).
    pub async fn add_dependency(&self, task_id: &str, prerequisite_id: &str) -> TaskResult<()> {
        self.deps
            .save_dependency(task_id, prerequisite_id)
            .await
            .map_err(Into::into)
    }

    /// True iff any prerequisite of `task_id` is not COMPLETED.
    pub async fn is_blocked(&self, task_id: &str) -> TaskResult<bool> {
        self.deps.is_blocked(task_id).await.map_err(Into::into)
    }

    /// Dependents whose blocker sets became empty now that
    /// `prerequisite_id` is COMPLETED.
    pub async fn resolve(&self, prerequisite_id: &str) -> TaskResult<Vec<String>> {
        self.deps.resolve(prerequisite_id).await.map_err(Into::into)
    }

    /// All prerequisites of a task.
    pub async fn prerequisites_of(&self, task_id: &str) -> TaskResult<Vec<String>> {
        self.deps
            .prerequisites_of(task_id)
            .await
            .map_err(Into::into)
    }

    /// All dependents of a task.
    pub async fn dependents_of(&self, task_id: &str) -> TaskResult<Vec<String>> {
        self.deps.dependents_of(task_id).await.map_err(Into::into)
    }
}
