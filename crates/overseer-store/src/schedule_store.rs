//! Schedule persistence.
//!
//! Schedules are user-managed cron definitions; a firing produces a new
//! task but does not embed its lifecycle.  The executor marks a firing
//! atomically (last run + next run in one statement) so a crash between
//! scan and delegate cannot double-fire the same occurrence.

use overseer_kernel::TaskPriority;
use tracing::instrument;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::model::Schedule;

const SCHEDULE_COLUMNS: &str =
    "id, cron_expression, timezone, prompt, priority, enabled, next_run_at, last_run_at, created_at";

#[derive(Clone)]
pub struct ScheduleStore {
    db: Database,
}

impl ScheduleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert a schedule by id.
    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.id))]
    pub async fn save_schedule(&self, schedule: &Schedule) -> StoreResult<()> {
        let schedule = schedule.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO schedules (id, cron_expression, timezone, prompt, priority, enabled, next_run_at, last_run_at, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                     ON CONFLICT(id) DO UPDATE SET \
                     cron_expression = excluded.cron_expression, timezone = excluded.timezone, \
                     prompt = excluded.prompt, priority = excluded.priority, enabled = excluded.enabled, \
                     next_run_at = excluded.next_run_at, last_run_at = excluded.last_run_at",
                    rusqlite::params![
                        schedule.id,
                        schedule.cron_expression,
                        schedule.timezone,
                        schedule.prompt,
                        schedule.priority.as_str(),
                        schedule.enabled,
                        schedule.next_run_at,
                        schedule.last_run_at,
                        schedule.created_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn find_schedule_by_id(&self, id: &str) -> StoreResult<Option<Schedule>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                    rusqlite::params![id],
                    map_schedule_row,
                );
                match result {
                    Ok(row) => row.into_schedule().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// All schedules, oldest first.
    #[instrument(skip(self))]
    pub async fn find_all_schedules(&self) -> StoreResult<Vec<Schedule>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at ASC, id ASC"
                ))?;
                let rows = stmt
                    .query_map([], map_schedule_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(ScheduleRow::into_schedule).collect()
            })
            .await
    }

    /// Enabled schedules whose `next_run_at` is at or before `now`.
    #[instrument(skip(self))]
    pub async fn find_due_schedules(&self, now: i64) -> StoreResult<Vec<Schedule>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules \
                     WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
                     ORDER BY next_run_at ASC"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![now], map_schedule_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(ScheduleRow::into_schedule).collect()
            })
            .await
    }

    /// Record a firing: set `last_run_at` and advance `next_run_at` in
    /// one statement.
    #[instrument(skip(self))]
    pub async fn mark_fired(
        &self,
        id: &str,
        last_run_at: i64,
        next_run_at: Option<i64>,
    ) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE schedules SET last_run_at = ?2, next_run_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, last_run_at, next_run_at],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "schedule",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Enable or disable a schedule; the caller supplies the recomputed
    /// `next_run_at` (None when disabling).
    #[instrument(skip(self))]
    pub async fn set_enabled(
        &self,
        id: &str,
        enabled: bool,
        next_run_at: Option<i64>,
    ) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE schedules SET enabled = ?2, next_run_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, enabled, next_run_at],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "schedule",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete_schedule(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM schedules WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                if deleted == 0 {
                    return Err(StoreError::NotFound {
                        entity: "schedule",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }
}

struct ScheduleRow {
    id: String,
    cron_expression: String,
    timezone: String,
    prompt: String,
    priority: String,
    enabled: bool,
    next_run_at: Option<i64>,
    last_run_at: Option<i64>,
    created_at: i64,
}

fn map_schedule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleRow> {
    Ok(ScheduleRow {
        id: row.get(0)?,
        cron_expression: row.get(1)?,
        timezone: row.get(2)?,
        prompt: row.get(3)?,
        priority: row.get(4)?,
        enabled: row.get(5)?,
        next_run_at: row.get(6)?,
        last_run_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

impl ScheduleRow {
    fn into_schedule(self) -> StoreResult<Schedule> {
        let priority =
            TaskPriority::parse(&self.priority).ok_or_else(|| StoreError::CorruptRow {
                entity: "schedules",
                message: format!("unknown priority `{}`", self.priority),
            })?;
        Ok(Schedule {
            id: self.id,
            cron_expression: self.cron_expression,
            timezone: self.timezone,
            prompt: self.prompt,
            priority,
            enabled: self.enabled,
            next_run_at: self.next_run_at,
            last_run_at: self.last_run_at,
            created_at: self.created_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> ScheduleStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        ScheduleStore::new(db)
    }

    fn schedule(id: &str, next_run_at: Option<i64>) -> Schedule {
        Schedule {
            id: id.to_string(),
            cron_expression: "0 9 * * 1-5".into(),
            timezone: "UTC".into(),
            prompt: "daily report".into(),
            priority: TaskPriority::P1,
            enabled: true,
            next_run_at,
            last_run_at: None,
            created_at: 1,
        }
    }

    #[tokio::test]
    async fn save_and_find_round_trip() {
        let store = setup().await;
        let s = schedule("s1", Some(1_000));
        store.save_schedule(&s).await.unwrap();
        assert_eq!(store.find_schedule_by_id("s1").await.unwrap().unwrap(), s);
    }

    #[tokio::test]
    async fn due_scan_respects_enabled_and_deadline() {
        let store = setup().await;
        store.save_schedule(&schedule("due", Some(500))).await.unwrap();
        store
            .save_schedule(&schedule("future", Some(5_000)))
            .await
            .unwrap();
        let mut disabled = schedule("disabled", Some(100));
        disabled.enabled = false;
        store.save_schedule(&disabled).await.unwrap();
        let mut unplanned = schedule("unplanned", None);
        unplanned.next_run_at = None;
        store.save_schedule(&unplanned).await.unwrap();

        let due = store.find_due_schedules(1_000).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["due"]);
    }

    #[tokio::test]
    async fn mark_fired_advances_the_clock() {
        let store = setup().await;
        store.save_schedule(&schedule("s1", Some(500))).await.unwrap();

        store.mark_fired("s1", 1_000, Some(2_000)).await.unwrap();
        let loaded = store.find_schedule_by_id("s1").await.unwrap().unwrap();
        assert_eq!(loaded.last_run_at, Some(1_000));
        assert_eq!(loaded.next_run_at, Some(2_000));

        // No longer due at t=1500.
        assert!(store.find_due_schedules(1_500).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_enabled_toggles_and_clears_next_run() {
        let store = setup().await;
        store.save_schedule(&schedule("s1", Some(500))).await.unwrap();

        store.set_enabled("s1", false, None).await.unwrap();
        let loaded = store.find_schedule_by_id("s1").await.unwrap().unwrap();
        assert!(!loaded.enabled);
        assert!(loaded.next_run_at.is_none());

        store.set_enabled("s1", true, Some(9_000)).await.unwrap();
        let loaded = store.find_schedule_by_id("s1").await.unwrap().unwrap();
        assert!(loaded.enabled);
        assert_eq!(loaded.next_run_at, Some(9_000));
    }

    #[tokio::test]
    async fn delete_missing_schedule_is_not_found() {
        let store = setup().await;
        let err = store.delete_schedule("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
