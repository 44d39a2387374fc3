//! Versioned schema migrations.
//!
//! The schema is defined as an ordered array of SQL payloads.  Applied
//! versions are recorded in a `_migrations` ledger table, so opening an
//! existing database only runs what is new, and re-running is a no-op.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// A single migration definition.
struct Migration {
    /// Monotonically increasing version number (1, 2, 3, ...).
    version: u32,
    /// Human-readable description.
    description: &'static str,
    /// Raw SQL to execute. May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// All migrations in order. Add new migrations to the end of this array.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "initial schema — tasks, task_output, dependencies, checkpoints",
        sql: r#"
            CREATE TABLE tasks (
                id                TEXT PRIMARY KEY,
                prompt            TEXT NOT NULL,
                priority          TEXT NOT NULL DEFAULT 'P1' CHECK(priority IN ('P0','P1','P2')),
                status            TEXT NOT NULL CHECK(status IN ('queued','blocked','running','completed','failed','cancelled')),
                working_directory TEXT,
                use_worktree      BOOLEAN NOT NULL DEFAULT 0,
                timeout_ms        INTEGER,
                max_output_buffer INTEGER,
                session_id        TEXT,
                worker_id         TEXT,
                exit_code         INTEGER,
                created_at        INTEGER NOT NULL,
                started_at        INTEGER,
                completed_at      INTEGER
            );
            CREATE INDEX idx_tasks_status ON tasks(status);
            CREATE INDEX idx_tasks_created ON tasks(created_at);

            CREATE TABLE task_output (
                task_id           TEXT PRIMARY KEY REFERENCES tasks(id) ON DELETE CASCADE,
                stdout            TEXT NOT NULL DEFAULT '[]',
                stderr            TEXT NOT NULL DEFAULT '[]',
                total_size        INTEGER NOT NULL DEFAULT 0,
                truncated         BOOLEAN NOT NULL DEFAULT 0,
                timeout           INTEGER,
                max_output_buffer INTEGER,
                updated_at        INTEGER NOT NULL
            );

            CREATE TABLE dependencies (
                task_id         TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                prerequisite_id TEXT NOT NULL REFERENCES tasks(id),
                created_at      INTEGER NOT NULL,
                PRIMARY KEY (task_id, prerequisite_id)
            );
            CREATE INDEX idx_dependencies_prereq ON dependencies(prerequisite_id);

            CREATE TABLE checkpoints (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id         TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                checkpoint_type TEXT NOT NULL CHECK(checkpoint_type IN ('completed','failed','cancelled')),
                output_summary  TEXT,
                error_summary   TEXT,
                git_branch      TEXT,
                git_commit_sha  TEXT,
                git_dirty_files TEXT,
                created_at      INTEGER NOT NULL
            );
            CREATE INDEX idx_checkpoints_task ON checkpoints(task_id);
        "#,
    },
    Migration {
        version: 2,
        description: "cron schedules — recurring delegation definitions",
        sql: r#"
            CREATE TABLE schedules (
                id              TEXT PRIMARY KEY,
                cron_expression TEXT NOT NULL,
                timezone        TEXT NOT NULL DEFAULT 'UTC',
                prompt          TEXT NOT NULL,
                priority        TEXT NOT NULL DEFAULT 'P1' CHECK(priority IN ('P0','P1','P2')),
                enabled         BOOLEAN NOT NULL DEFAULT 1,
                next_run_at     INTEGER,
                last_run_at     INTEGER,
                created_at      INTEGER NOT NULL
            );
            CREATE INDEX idx_schedules_due ON schedules(enabled, next_run_at);
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Bring `conn` up to the latest schema version.
///
/// Synchronous; the [`Database`](crate::db::Database) wrapper calls it
/// from the blocking pool.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_ledger(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(version = current, "schema already current");
        return Ok(());
    }

    info!(from = current, count = pending.len(), "migrating schema");
    for migration in pending {
        apply(conn, migration)?;
    }

    info!(
        version = MIGRATIONS.last().map(|m| m.version).unwrap_or(0),
        "schema migration finished"
    );
    Ok(())
}

/// The highest recorded migration version; 0 on a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    let version: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Migration {
            version: 0,
            message: format!("could not determine the schema version: {e}"),
        })?;
    Ok(version)
}

// ── internals ────────────────────────────────────────────────────────

/// Make sure the `_migrations` ledger exists before consulting it.
fn ensure_ledger(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("could not create the _migrations ledger: {e}"),
    })?;
    Ok(())
}

/// Run one migration and its ledger entry atomically.
///
/// The transaction is driven with raw BEGIN/COMMIT/ROLLBACK statements
/// because only a shared `&Connection` is available here.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying schema change"
    );

    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("BEGIN failed: {e}"),
        })?;

    let result = (|| -> StoreResult<()> {
        conn.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                message: format!("migration SQL failed: {e}"),
            })?;

        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.version, migration.description, now],
        )
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("recording the ledger entry failed: {e}"),
        })?;

        Ok(())
    })();

    match &result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| StoreError::Migration {
                    version: migration.version,
                    message: format!("COMMIT failed: {e}"),
                })?;
            debug!(version = migration.version, "schema change applied");
        }
        Err(err) => {
            warn!(version = migration.version, %err, "rolling back failed schema change");
            let _ = conn.execute_batch("ROLLBACK;");
        }
    }

    result
}

// ── tests ────────────────────────────────────────────────────────────
