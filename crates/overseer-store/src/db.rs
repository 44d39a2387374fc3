//! SQLite connection handling.
//!
//! [`Database`] owns a single `rusqlite::Connection` behind an
//! `Arc<Mutex<>>`.  rusqlite is synchronous, so every operation hops to
//! the blocking thread pool; async callers hand a closure to
//! [`Database::execute`] / [`Database::execute_mut`] and get a
//! `StoreResult` back.  Journal mode prefers WAL and steps down to
//! DELETE or MEMORY on filesystems that refuse it.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Shared handle to the daemon's SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file at `path`.
    ///
    /// Synchronous — meant for startup, before the async loops exist.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Purely in-memory database for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open `path` and bring the schema up to date in one step.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Apply any schema migrations not yet recorded.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("connection lock poisoned: {e}")))?;
            migration::run_all(&conn)
        })
        .await?
    }

    /// Run a read/write closure against the connection.
    ///
    /// The closure executes on the blocking pool with the connection
    /// lock held; keep it to SQL work only.
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("connection lock poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    /// Like [`Database::execute`], but with a `&mut Connection` so the
    /// closure can open a `rusqlite` transaction.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("connection lock poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }

    // ── pragmas ──────────────────────────────────────────────────────

    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        let journal_mode = Self::select_journal_mode(conn);

        // NORMAL is sufficient alongside WAL: losing power can drop the
        // tail transaction, never the file.
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        // Scratch space stays off disk.
        conn.pragma_update(None, "temp_store", "MEMORY")?;

        // Cascading deletes depend on enforced foreign keys.
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Contending writers queue up instead of erroring out.
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

        info!(journal_mode, "database ready");
        Ok(())
    }

    /// Try WAL, then DELETE, then MEMORY; return the mode that stuck.
    fn select_journal_mode(conn: &Connection) -> &'static str {
        for mode in ["WAL", "DELETE", "MEMORY"] {
            let applied: Result<String, _> =
                conn.pragma_update_and_check(None, "journal_mode", mode, |row| row.get(0));
            match applied {
                Ok(active) if active.eq_ignore_ascii_case(mode) => return mode,
                Ok(active) => {
                    // In-memory databases report "memory" regardless.
                    if active.eq_ignore_ascii_case("memory") {
                        return "MEMORY";
                    }
                    warn!(requested = mode, active, "journal mode not honoured, trying next");
                }
                Err(err) => warn!(requested = mode, %err, "journal mode rejected, trying next"),
            }
        }
        "MEMORY"
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_runs_against_a_live_connection() {
        let db = Database::open_in_memory().unwrap();
        let version: String = db
            .execute(|conn| {
                let v: String = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
                Ok(v)
            })
            .await
            .unwrap();
        assert!(!version.is_empty());
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let db = Database::open_in_memory().unwrap();
        let enabled: i64 = db
            .execute(|conn| {
                let v: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
                Ok(v)
            })
            .await
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[tokio::test]
    async fn fresh_database_gets_the_schema() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();

        let count: i64 = db
            .execute(|conn| {
                let c: i64 = conn.query_row("SELECT count(*) FROM tasks", [], |row| row.get(0))?;
                Ok(c)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn journal_mode_lands_on_a_supported_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_and_migrate(dir.path().join("overseer.db"))
            .await
            .unwrap();
        let mode: String = db
            .execute(|conn| {
                let v: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
                Ok(v)
            })
            .await
            .unwrap();
        assert!(["wal", "delete", "memory"].contains(&mode.to_lowercase().as_str()));
    }
}
