//! Environment-driven daemon configuration.
//!
//! Every tunable has a default, and the ones with documented ranges are
//! clamped rather than rejected: a daemon that refuses to boot over a
//! typo'd env var helps nobody.  Caller-supplied per-task overrides go
//! through [`Config::validate_timeout_ms`] / [`Config::validate_buffer_bytes`]
//! instead, which reject out-of-range values.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{TaskError, TaskResult};

/// Default per-task timeout: 30 minutes.
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 1_800_000;
/// Valid range for task timeouts: 1 second to 24 hours.
pub const TASK_TIMEOUT_RANGE_MS: (u64, u64) = (1_000, 86_400_000);

/// Default in-memory output budget: 10 MiB.
pub const DEFAULT_MAX_OUTPUT_BUFFER: u64 = 10_485_760;
/// Valid range for output budgets: 1 KiB to 1 GiB.
pub const MAX_OUTPUT_BUFFER_RANGE: (u64, u64) = (1_024, 1_073_741_824);

/// Deployment profile, selected by `OVERSEER_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Development,
    Production,
}

/// Daemon configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Deployment profile (`OVERSEER_ENV`: `production` or anything else).
    pub profile: Profile,
    /// Default per-task timeout in milliseconds (`TASK_TIMEOUT`).
    pub task_timeout_ms: u64,
    /// Default per-task output budget in bytes (`MAX_OUTPUT_BUFFER`).
    pub max_output_buffer: u64,
    /// Smoothed-CPU admission threshold in percent (`CPU_THRESHOLD`).
    pub cpu_threshold: f32,
    /// Free-memory reserve in bytes (`MEMORY_RESERVE`).
    pub memory_reserve: u64,
    /// Hard cap on concurrent workers (`OVERSEER_MAX_WORKERS`).
    pub max_workers: usize,
    /// Autoscaler low-water CPU mark in percent.
    pub cpu_low_water: f32,
    /// Resource monitor sample cadence.
    pub monitor_interval: Duration,
    /// Autoscaler control-loop cadence.
    pub autoscale_interval: Duration,
    /// Event-bus request/response timeout.
    pub request_timeout: Duration,
    /// Store write retry attempts.
    pub store_retries: u32,
    /// Fixed backoff between store retries.
    pub store_retry_backoff: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Maximum collapsed firings per due schedule scan.
    pub misfire_cap: u32,
    /// Data directory holding the database and spill files
    /// (`OVERSEER_DATA_DIR`, default `./data`).
    pub data_dir: PathBuf,
    /// Agent argv prefix; the task prompt is appended as the final
    /// argument (`OVERSEER_AGENT_CMD`, whitespace-split).
    pub agent_command: Vec<String>,
}

impl Config {
    /// Assemble configuration from the process environment.
    pub fn from_env() -> Self {
        let profile = match env_non_empty("OVERSEER_ENV").as_deref() {
            Some("production") | Some("prod") => Profile::Production,
            _ => Profile::Development,
        };

        let (default_cpu, default_reserve) = match profile {
            Profile::Development => (95.0, 100_000_000),
            Profile::Production => (80.0, 1_073_741_824),
        };

        let task_timeout_ms = clamped_env_u64(
            "TASK_TIMEOUT",
            DEFAULT_TASK_TIMEOUT_MS,
            TASK_TIMEOUT_RANGE_MS,
        );
        let max_output_buffer = clamped_env_u64(
            "MAX_OUTPUT_BUFFER",
            DEFAULT_MAX_OUTPUT_BUFFER,
            MAX_OUTPUT_BUFFER_RANGE,
        );

        let cpu_threshold = env_non_empty("CPU_THRESHOLD")
            .and_then(|v| v.parse::<f32>().ok())
            .map(|v| v.clamp(1.0, 100.0))
            .unwrap_or(default_cpu);

        let memory_reserve = env_non_empty("MEMORY_RESERVE")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default_reserve);

        let max_workers = env_non_empty("OVERSEER_MAX_WORKERS")
            .and_then(|v| v.parse::<usize>().ok())
            .map(|v| v.clamp(1, 256))
            .unwrap_or(8);

        let data_dir = env_non_empty("OVERSEER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data"));

        let agent_command = env_non_empty("OVERSEER_AGENT_CMD")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|| vec!["claude".to_string(), "-p".to_string()]);

        Self {
            profile,
            task_timeout_ms,
            max_output_buffer,
            cpu_threshold,
            memory_reserve,
            max_workers,
            cpu_low_water: (cpu_threshold - 30.0).max(10.0),
            monitor_interval: Duration::from_secs(1),
            autoscale_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            store_retries: 3,
            store_retry_backoff: Duration::from_secs(1),
            kill_grace: Duration::from_secs(5),
            misfire_cap: 1,
            data_dir,
            agent_command,
        }
    }

    /// Validate a caller-supplied timeout override.
    pub fn validate_timeout_ms(&self, timeout_ms: u64) -> TaskResult<u64> {
        let (lo, hi) = TASK_TIMEOUT_RANGE_MS;
        if (lo..=hi).contains(&timeout_ms) {
            Ok(timeout_ms)
        } else {
            Err(TaskError::invalid_input(format!(
                "timeout {timeout_ms}ms outside [{lo}, {hi}]"
            ))
            .with_context("timeout", timeout_ms))
        }
    }

    /// Validate a caller-supplied output-buffer override.
    pub fn validate_buffer_bytes(&self, bytes: u64) -> TaskResult<u64> {
        let (lo, hi) = MAX_OUTPUT_BUFFER_RANGE;
        if (lo..=hi).contains(&bytes) {
            Ok(bytes)
        } else {
            Err(TaskError::invalid_input(format!(
                "maxOutputBuffer {bytes} outside [{lo}, {hi}]"
            ))
            .with_context("max_output_buffer", bytes))
        }
    }

    /// Path of the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("overseer.db")
    }

    /// Directory for output spill files.
    pub fn spill_dir(&self) -> PathBuf {
        self.data_dir.join("spill")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Read an env var, treating empty strings as unset.
fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an env var as u64 and clamp it into `range`, warning when the
/// raw value fell outside.
fn clamped_env_u64(key: &str, default: u64, range: (u64, u64)) -> u64 {
    let Some(raw) = env_non_empty(key) else {
        return default;
    };
    let Ok(value) = raw.parse::<u64>() else {
        tracing::warn!(key, raw, "ignoring unparseable value, using default");
        return default;
    };
    let clamped = value.clamp(range.0, range.1);
    if clamped != value {
        tracing::warn!(key, value, clamped, "value outside range, clamped");
    }
    clamped
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_in_range() {
        let config = Config {
            profile: Profile::Development,
            ..Config::from_env()
        };
        assert!(config.validate_timeout_ms(config.task_timeout_ms).is_ok());
        assert!(config
            .validate_buffer_bytes(config.max_output_buffer)
            .is_ok());
    }

    #[test]
    fn timeout_override_range_is_enforced() {
        let config = Config::from_env();
        assert!(config.validate_timeout_ms(500).is_err());
        assert!(config.validate_timeout_ms(1_000).is_ok());
        assert!(config.validate_timeout_ms(86_400_000).is_ok());
        assert!(config.validate_timeout_ms(86_400_001).is_err());
    }

    #[test]
    fn buffer_override_range_is_enforced() {
        let config = Config::from_env();
        assert!(config.validate_buffer_bytes(512).is_err());
        assert!(config.validate_buffer_bytes(1_024).is_ok());
        assert!(config.validate_buffer_bytes(2_000_000_000).is_err());
    }
}
