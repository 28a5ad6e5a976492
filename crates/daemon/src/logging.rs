//! Tracing setup for the daemon

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::error::DaemonError;

const LOG_FILE_PREFIX: &str = "lazyfs.log";

/// Install the global subscriber. Filtering follows `RUST_LOG` and defaults
/// to `info`. With a log directory, events are also written to a daily
/// rotated file; keep the returned guard alive to flush it.
pub fn init(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>, DaemonError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_writer(std::io::stderr).boxed();

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init()
        .map_err(|e| DaemonError::Logging(e.to_string()))?;
    Ok(guard)
}
