//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! The guard itself only emits `tracing` events (sink failures, policy
//! probes); these initialisers are a convenience for hosts that have not set
//! up a subscriber of their own.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Holds the non-blocking writer guard for file logging.
///
/// Must be kept alive for the duration of the process; dropping it flushes
/// pending log entries and closes the file.
#[derive(Debug)]
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Initialise console-only logging on stderr.
///
/// Level is controlled by `RUST_LOG` (default: `info`).
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_console() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logging subscriber: {e}"))
}

/// Initialise logging with a daily-rotated JSON file layer plus console
/// output on stderr.
///
/// Writes JSON logs to `{logs_dir}/toolguard.log.YYYY-MM-DD`. Returns a
/// [`LoggingGuard`] that must be kept alive for log flushing.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or a global
/// subscriber is already installed.
pub fn init_with_file(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "toolguard.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking);

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logging subscriber: {e}"))?;

    Ok(LoggingGuard { _guard: guard })
}
