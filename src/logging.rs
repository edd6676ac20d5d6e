//! Optional tracing setup for hosts that do not install their own subscriber.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::errors::EngineError;

/// Install a stdout plus daily-rolling-file subscriber and hand the flush
/// guard back to the caller. The engine keeps no global state here: dropping
/// the guard flushes buffered lines, so hosts hold it for the engine's
/// lifetime. If a subscriber is already installed this becomes a no-op and
/// the returned guard still owns the (unused) file writer.
pub fn init(log_dir: &Path) -> Result<WorkerGuard, EngineError> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| EngineError::Config(format!("create log dir {}: {e}", log_dir.display())))?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "engine.log"));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init();

    Ok(guard)
}
