//! Error types for the overseer-cron crate.

use overseer_kernel::TaskError;
use thiserror::Error;

/// Alias for `Result<T, CronError>`.
pub type CronResult<T> = Result<T, CronError>;

#[derive(Debug, Error)]
pub enum CronError {
    /// The cron expression failed to parse or had the wrong field count.
    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// The timezone name is not a known IANA zone.
    #[error("unknown timezone `{timezone}`")]
    InvalidTimezone { timezone: String },

    /// The executor was started twice or stopped while not running.
    #[error("{0}")]
    Lifecycle(String),

    /// Persistence failed underneath the executor.
    #[error(transparent)]
    Store(#[from] overseer_store::StoreError),
}

impl From<CronError> for TaskError {
    fn from(err: CronError) -> Self {
        match err {
            CronError::InvalidExpression { .. } | CronError::InvalidTimezone { .. } => {
                TaskError::invalid_input(err.to_string())
            }
            CronError::Store(store) => store.into(),
            CronError::Lifecycle(message) => TaskError::system(message),
        }
    }
}
