//! Background schedule executor.
//!
//! A 1-second ticker scans enabled schedules whose `next_run_at` has
//! passed.  Each due schedule is marked fired first — `last_run_at` set
//! and `next_run_at` advanced strictly past now in one update — and only
//! then is `ScheduleDue` emitted, so a crash between the two steps skips
//! a firing rather than doubling it.  Occurrences missed while the
//! daemon was down collapse to at most `misfire_cap` firings (default
//! one): the contract is "fire once per scheduled minute observed
//! alive", not "catch up".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use overseer_kernel::{EventBus, EventPayload};
use overseer_store::{Schedule, ScheduleStore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{CronError, CronResult};
use crate::expression::{next_run_after, parse_expression, parse_timezone};

/// Ticker resolution.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Scans the schedule store and emits `ScheduleDue` events.
pub struct ScheduleExecutor {
    schedules: ScheduleStore,
    bus: EventBus,
    misfire_cap: u32,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ScheduleExecutor {
    pub fn new(schedules: ScheduleStore, bus: EventBus, misfire_cap: u32) -> Self {
        Self {
            schedules,
            bus,
            misfire_cap: misfire_cap.max(1),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Start the background ticker.
    pub fn start(&mut self) -> CronResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CronError::Lifecycle(
                "schedule executor is already running".to_string(),
            ));
        }

        let running = Arc::clone(&self.running);
        let schedules = self.schedules.clone();
        let bus = self.bus.clone();
        let misfire_cap = self.misfire_cap;

        self.handle = Some(tokio::spawn(async move {
            info!("schedule executor started");
            while running.load(Ordering::SeqCst) {
                if let Err(err) = scan_once(&schedules, &bus, misfire_cap).await {
                    error!(%err, "schedule scan failed");
                }
                tokio::time::sleep(TICK_INTERVAL).await;
            }
            info!("schedule executor stopped");
        }));
        Ok(())
    }

    /// Stop the ticker and wait for it to finish.
    pub async fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("stop called but schedule executor is not running");
            return;
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                error!(%err, "schedule executor task panicked during shutdown");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one scan immediately.  Exposed for tests and for the daemon's
    /// startup pass.
    pub async fn scan_now(&self) -> CronResult<()> {
        scan_once(&self.schedules, &self.bus, self.misfire_cap).await
    }
}

/// One due-scan pass over the store.
async fn scan_once(schedules: &ScheduleStore, bus: &EventBus, misfire_cap: u32) -> CronResult<()> {
    let now = Utc::now();
    let due = schedules.find_due_schedules(now.timestamp_millis()).await?;

    for schedule in due {
        match fire(schedules, bus, &schedule, misfire_cap, now).await {
            Ok(fired) => {
                debug!(schedule_id = %schedule.id, fired, "schedule fired");
            }
            Err(err) => {
                error!(schedule_id = %schedule.id, %err, "schedule firing failed");
            }
        }
    }
    Ok(())
}

/// Fire one due schedule: advance its clock, then emit.
async fn fire(
    schedules: &ScheduleStore,
    bus: &EventBus,
    schedule: &Schedule,
    misfire_cap: u32,
    now: chrono::DateTime<Utc>,
) -> CronResult<u32> {
    let parsed = match parse_expression(&schedule.cron_expression) {
        Ok(parsed) => parsed,
        Err(err) => {
            // A row with a bad expression would come due on every tick;
            // disable it instead of spamming the log once a second.
            warn!(schedule_id = %schedule.id, %err, "disabling schedule with invalid expression");
            schedules.set_enabled(&schedule.id, false, None).await?;
            return Err(err);
        }
    };
    let tz = match parse_timezone(&schedule.timezone) {
        Ok(tz) => tz,
        Err(err) => {
            warn!(schedule_id = %schedule.id, %err, "disabling schedule with invalid timezone");
            schedules.set_enabled(&schedule.id, false, None).await?;
            return Err(err);
        }
    };

    // Count the occurrences missed in (next_run_at, now]; they collapse
    // to at most `misfire_cap` firings.
    let fired = match schedule.next_run_at {
        Some(due_at) => {
            let due_time = Utc
                .timestamp_millis_opt(due_at)
                .single()
                .unwrap_or(now);
            let mut missed: u32 = 0;
            for occurrence in parsed.after(&(due_time - chrono::Duration::milliseconds(1)).with_timezone(&tz)) {
                if occurrence.with_timezone(&Utc) > now || missed >= misfire_cap {
                    break;
                }
                missed += 1;
            }
            missed.clamp(1, misfire_cap)
        }
        None => 1,
    };

    let next_run_at = next_run_after(&parsed, tz, now).map(|dt| dt.timestamp_millis());
    schedules
        .mark_fired(&schedule.id, now.timestamp_millis(), next_run_at)
        .await?;

    for _ in 0..fired {
        if let Err(err) = bus
            .emit(EventPayload::ScheduleDue {
                schedule_id: schedule.id.clone(),
                prompt: schedule.prompt.clone(),
                priority: schedule.priority,
            })
            .await
        {
            error!(schedule_id = %schedule.id, %err, "ScheduleDue subscriber failed");
        }
    }
    Ok(fired)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
