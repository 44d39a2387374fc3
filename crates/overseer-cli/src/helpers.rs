//! Shared CLI helpers.

use tracing_subscriber::EnvFilter;

/// Initialise tracing to **stderr** — stdout belongs to the JSON-RPC
/// channel.  `RUST_LOG` wins; otherwise `LOG_LEVEL` (the daemon's own
/// env knob); otherwise the given default.
pub fn init_tracing(default_level: &str) {
    let level = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| default_level.to_string());

    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new(default_level));

    // A second init (tests) is fine to ignore.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Render an epoch-milliseconds timestamp for human output.
pub fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}
