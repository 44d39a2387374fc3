//! Cron scheduling for the overseer daemon.
//!
//! [`expression`] handles 5-field POSIX expressions evaluated in an IANA
//! timezone; [`executor`] runs the 1-second ticker that turns due
//! schedules into `ScheduleDue` events.

pub mod error;
pub mod executor;
pub mod expression;

pub use error::{CronError, CronResult};
pub use executor::ScheduleExecutor;
pub use expression::{get_next_run_times, next_run_after, parse_expression, parse_timezone};
