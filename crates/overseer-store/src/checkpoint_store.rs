//! Checkpoint persistence.
//!
//! A checkpoint is written at each terminal transition of a task that
//! has dependents; the latest one per prerequisite feeds the
//! "DEPENDENCY CONTEXT" section prepended to dependent prompts.

use tracing::instrument;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::model::{Checkpoint, CheckpointType};

#[derive(Clone)]
pub struct CheckpointStore {
    db: Database,
}

impl CheckpointStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a checkpoint for a task.
    #[instrument(skip(self, checkpoint), fields(task_id = %checkpoint.task_id))]
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        let checkpoint = checkpoint.clone();
        let dirty = checkpoint
            .git_dirty_files
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO checkpoints (task_id, checkpoint_type, output_summary, error_summary, \
                     git_branch, git_commit_sha, git_dirty_files, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        checkpoint.task_id,
                        checkpoint.checkpoint_type.as_str(),
                        checkpoint.output_summary,
                        checkpoint.error_summary,
                        checkpoint.git_branch,
                        checkpoint.git_commit_sha,
                        dirty,
                        checkpoint.created_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// The most recent checkpoint of a task, if any.
    #[instrument(skip(self))]
    pub async fn find_latest_checkpoint(&self, task_id: &str) -> StoreResult<Option<Checkpoint>> {
        let task_id = task_id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    "SELECT task_id, checkpoint_type, output_summary, error_summary, \
                     git_branch, git_commit_sha, git_dirty_files, created_at \
                     FROM checkpoints WHERE task_id = ?1 \
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    rusqlite::params![task_id],
                    |row| {
                        Ok(CheckpointRow {
                            task_id: row.get(0)?,
                            checkpoint_type: row.get(1)?,
                            output_summary: row.get(2)?,
                            error_summary: row.get(3)?,
                            git_branch: row.get(4)?,
                            git_commit_sha: row.get(5)?,
                            git_dirty_files: row.get(6)?,
                            created_at: row.get(7)?,
                        })
                    },
                );
                match result {
                    Ok(row) => row.into_checkpoint().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }
}

struct CheckpointRow {
    task_id: String,
    checkpoint_type: String,
    output_summary: Option<String>,
    error_summary: Option<String>,
    git_branch: Option<String>,
    git_commit_sha: Option<String>,
    git_dirty_files: Option<String>,
    created_at: i64,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> StoreResult<Checkpoint> {
        let checkpoint_type =
            CheckpointType::parse(&self.checkpoint_type).ok_or_else(|| StoreError::CorruptRow {
                entity: "checkpoints",
                message: format!("unknown checkpoint_type `{}`", self.checkpoint_type),
            })?;
        let git_dirty_files = self
            .git_dirty_files
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Checkpoint {
            task_id: self.task_id,
            checkpoint_type,
            output_summary: self.output_summary,
            error_summary: self.error_summary,
            git_branch: self.git_branch,
            git_commit_sha: self.git_commit_sha,
            git_dirty_files,
            created_at: self.created_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_store::{new_task, TaskStore};
    use overseer_kernel::TaskPriority;

    async fn setup() -> (CheckpointStore, String) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let tasks = TaskStore::new(db.clone());
        let task = new_task("echo", TaskPriority::P1);
        tasks.save_task(&task).await.unwrap();
        (CheckpointStore::new(db), task.id)
    }

    fn checkpoint(task_id: &str, created_at: i64) -> Checkpoint {
        Checkpoint {
            task_id: task_id.to_string(),
            checkpoint_type: CheckpointType::Completed,
            output_summary: Some("built ok".into()),
            error_summary: None,
            git_branch: Some("main".into()),
            git_commit_sha: Some("abc123".into()),
            git_dirty_files: Some(vec!["src/lib.rs".into()]),
            created_at,
        }
    }

    #[tokio::test]
    async fn save_and_find_latest() {
        let (store, id) = setup().await;
        store.save_checkpoint(&checkpoint(&id, 100)).await.unwrap();

        let loaded = store.find_latest_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint(&id, 100));
    }

    #[tokio::test]
    async fn latest_wins_over_earlier() {
        let (store, id) = setup().await;
        store.save_checkpoint(&checkpoint(&id, 100)).await.unwrap();

        let mut newer = checkpoint(&id, 200);
        newer.checkpoint_type = CheckpointType::Failed;
        newer.error_summary = Some("exit 1".into());
        store.save_checkpoint(&newer).await.unwrap();

        let loaded = store.find_latest_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint_type, CheckpointType::Failed);
        assert_eq!(loaded.error_summary.as_deref(), Some("exit 1"));
    }

    #[tokio::test]
    async fn missing_checkpoint_is_none() {
        let (store, _) = setup().await;
        assert!(store.find_latest_checkpoint("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn optional_fields_round_trip_absent() {
        let (store, id) = setup().await;
        let bare = Checkpoint {
            task_id: id.clone(),
            checkpoint_type: CheckpointType::Cancelled,
            output_summary: None,
            error_summary: None,
            git_branch: None,
            git_commit_sha: None,
            git_dirty_files: None,
            created_at: 1,
        };
        store.save_checkpoint(&bare).await.unwrap();
        let loaded = store.find_latest_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(loaded, bare);
    }
}
