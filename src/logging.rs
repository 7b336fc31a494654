use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

use crate::core::config::ConfigError;
use crate::platform::{NativePlatform, Platform};

pub const LOG_FILE: &str = "labelloop.log";

pub fn parse_level(value: &str) -> Result<Level, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(ConfigError::InvalidValue {
            param: "log_level".into(),
            reason: format!("'{}' is not a log level", other),
        }),
    }
}

/// Non-blocking appender on `<data_dir>/labelloop.log`. Buffered lines are
/// flushed when the guard drops.
pub(crate) fn file_writer(data_dir: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let path = data_dir.join(LOG_FILE);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("creating log file {}", path.display()))?;
    NativePlatform::restrict_file_permissions(&path);

    let appender = rolling::never(data_dir, LOG_FILE);
    Ok(tracing_appender::non_blocking(appender))
}

/// Every line goes to the log file. `--verbose` echoes it to stderr as well.
pub(crate) fn make_writer(file: NonBlocking, echo_stderr: bool) -> BoxMakeWriter {
    if echo_stderr {
        BoxMakeWriter::new(file.and(std::io::stderr))
    } else {
        BoxMakeWriter::new(file)
    }
}

pub(crate) fn build_subscriber(level: Level, writer: BoxMakeWriter) -> impl Subscriber + Send + Sync {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(writer)
        .finish()
}

/// Install the global subscriber. Only the first call in a process takes
/// effect. Lines reach the file only while the returned guard is alive.
pub fn init_logging(level: Level, data_dir: &Path, echo_stderr: bool) -> Result<WorkerGuard> {
    let (file, guard) = file_writer(data_dir)?;
    let subscriber = build_subscriber(level, make_writer(file, echo_stderr));
    tracing::subscriber::set_global_default(subscriber).ok();
    Ok(guard)
}
