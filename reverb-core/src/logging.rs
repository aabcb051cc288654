//! Structured logging setup using the `tracing` ecosystem.
//!
//! The client itself only emits `tracing` events; installing a subscriber is
//! left to the embedding application, which calls one of these helpers.

use std::path::{Path, PathBuf};

use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ReverbError, ReverbResult};

/// File name prefix for rotated log files.
const LOG_FILE_NAME: &str = "reverb.log";

/// Guard that keeps the non-blocking log writer alive.
/// Drop this to flush and close the log file.
pub struct LogGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Build the level filter, letting `RUST_LOG` win over the configured level.
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the global tracing subscriber.
///
/// Sets up compact console output on stderr plus a daily-rotated file in
/// `log_dir`. With `json_output` the file layer emits one JSON object per line.
///
/// # Arguments
/// * `level` - Log level or filter directive, e.g. "info" or "reverb_socket=debug"
/// * `log_dir` - Directory for log files
/// * `json_output` - If true, use JSON format for file output
pub fn init_logging(level: &str, log_dir: &Path, json_output: bool) -> ReverbResult<LogGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact();

    let registry = tracing_subscriber::registry()
        .with(build_filter(level))
        .with(console_layer);

    let result = if json_output {
        registry
            .with(
                fmt::layer()
                    .with_writer(non_blocking)
                    .json()
                    .with_current_span(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
    };
    result.map_err(|e| ReverbError::Config(format!("logging already initialized: {e}")))?;

    tracing::info!(filter = level, dir = %log_dir.display(), "logging initialized");

    Ok(LogGuard { _guard: guard })
}

/// Initialize a minimal console-only logger for tests or simple embedding.
///
/// Subsequent calls are no-ops.
pub fn init_console_logging(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(build_filter(level))
        .with(fmt::layer().with_target(true).compact())
        .try_init();
}

/// Default directory for log files: `<data dir>/reverb/logs`.
pub fn default_log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reverb")
        .join("logs")
}
