//! Captured output persistence.
//!
//! One row per task holding the stdout/stderr line arrays as embedded
//! JSON, the total byte count, the truncation marker, and the effective
//! timeout / buffer limits the task ran with.

use tracing::instrument;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::model::TaskOutput;

/// Which stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// CRUD on the `task_output` table.
#[derive(Clone)]
pub struct OutputStore {
    db: Database,
}

impl OutputStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert the full captured output of a task.
    ///
    /// `timeout` and `max_output_buffer` record the effective limits the
    /// task ran with (row columns, not task-row duplicates).
    #[instrument(skip(self, output))]
    pub async fn save_output(
        &self,
        task_id: &str,
        output: &TaskOutput,
        timeout: Option<u64>,
        max_output_buffer: Option<u64>,
    ) -> StoreResult<()> {
        let task_id = task_id.to_string();
        let stdout = serde_json::to_string(&output.stdout)?;
        let stderr = serde_json::to_string(&output.stderr)?;
        let total_size = output.total_size;
        let truncated = output.truncated;
        let now = chrono::Utc::now().timestamp_millis();

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO task_output (task_id, stdout, stderr, total_size, truncated, timeout, max_output_buffer, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                     ON CONFLICT(task_id) DO UPDATE SET \
                     stdout = excluded.stdout, stderr = excluded.stderr, \
                     total_size = excluded.total_size, truncated = excluded.truncated, \
                     timeout = excluded.timeout, max_output_buffer = excluded.max_output_buffer, \
                     updated_at = excluded.updated_at",
                    rusqlite::params![
                        task_id,
                        stdout,
                        stderr,
                        total_size,
                        truncated,
                        timeout,
                        max_output_buffer,
                        now
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Append lines to one stream of an existing (or fresh) output row.
    #[instrument(skip(self, text))]
    pub async fn append_output(
        &self,
        task_id: &str,
        stream: OutputStream,
        text: &str,
    ) -> StoreResult<()> {
        let task_id = task_id.to_string();
        let text = text.to_string();
        let now = chrono::Utc::now().timestamp_millis();

        self.db
            .execute(move |conn| {
                let existing = conn.query_row(
                    "SELECT stdout, stderr, total_size FROM task_output WHERE task_id = ?1",
                    rusqlite::params![task_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u64>(2)?,
                        ))
                    },
                );
                let (stdout_json, stderr_json, total) = match existing {
                    Ok(row) => row,
                    Err(rusqlite::Error::QueryReturnedNoRows) => {
                        ("[]".to_string(), "[]".to_string(), 0)
                    }
                    Err(e) => return Err(StoreError::Sqlite(e)),
                };

                let mut stdout: Vec<String> = serde_json::from_str(&stdout_json)?;
                let mut stderr: Vec<String> = serde_json::from_str(&stderr_json)?;
                let target = match stream {
                    OutputStream::Stdout => &mut stdout,
                    OutputStream::Stderr => &mut stderr,
                };
                let mut lines: Vec<&str> = text.split('\n').collect();
                if lines.last() == Some(&"") {
                    lines.pop();
                }
                target.extend(lines.into_iter().map(str::to_string));
                let total = total + text.len() as u64;

                conn.execute(
                    "INSERT INTO task_output (task_id, stdout, stderr, total_size, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(task_id) DO UPDATE SET \
                     stdout = excluded.stdout, stderr = excluded.stderr, \
                     total_size = excluded.total_size, updated_at = excluded.updated_at",
                    rusqlite::params![
                        task_id,
                        serde_json::to_string(&stdout)?,
                        serde_json::to_string(&stderr)?,
                        total,
                        now
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Read the captured output of a task.  A task without an output row
    /// (never started) reads as empty.
    #[instrument(skip(self))]
    pub async fn read_output(&self, task_id: &str) -> StoreResult<TaskOutput> {
        let task_id = task_id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    "SELECT stdout, stderr, total_size, truncated FROM task_output WHERE task_id = ?1",
                    rusqlite::params![task_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u64>(2)?,
                            row.get::<_, bool>(3)?,
                        ))
                    },
                );
                match result {
                    Ok((stdout_json, stderr_json, total_size, truncated)) => Ok(TaskOutput {
                        stdout: serde_json::from_str(&stdout_json)?,
                        stderr: serde_json::from_str(&stderr_json)?,
                        total_size,
                        truncated,
                    }),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(TaskOutput::default()),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Last `tail` lines per stream, oldest first.
    #[instrument(skip(self))]
    pub async fn read_tail(&self, task_id: &str, tail: usize) -> StoreResult<TaskOutput> {
        let mut output = self.read_output(task_id).await?;
        let skip_to = |lines: &mut Vec<String>| {
            if lines.len() > tail {
                *lines = lines.split_off(lines.len() - tail);
            }
        };
        skip_to(&mut output.stdout);
        skip_to(&mut output.stderr);
        Ok(output)
    }
}

// ── tests ────────────────────────────────────────────────────────────
