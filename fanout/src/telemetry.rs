//! Tracing initialisation shared by binaries embedding the core.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber: human-readable stdout, plus a JSON log
/// file when `log_path` is given.
pub fn init_tracing(filter: &str, log_path: Option<&Path>) -> Result<()> {
    let json_file = log_path
        .map(|path| {
            let writer = open_log_writer(path)?;
            Ok::<_, anyhow::Error>(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(EnvFilter::new(filter)),
            )
        })
        .transpose()?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_filter(EnvFilter::new(filter)),
        )
        .with(json_file)
        .try_init()?;
    Ok(())
}

/// Open the log file append-only behind a non-blocking writer. The worker
/// guard must outlive the subscriber, so it is parked in a static.
fn open_log_writer(path: &Path) -> Result<NonBlocking> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let _ = LOG_GUARD.set(guard);
    Ok(writer)
}
