//! Logging setup
//!
//! Text or JSON output through `tracing-subscriber`, to stderr or to a daily
//! rolling file through a non-blocking `tracing-appender` writer.

use crate::config::{LogFormat, LoggingConfig};
use crate::{Error, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// The returned guard flushes the file writer on drop and must be held for
/// as long as the process logs.
///
/// # Errors
///
/// Returns [`Error::Config`] if the level filter does not parse, the log
/// directory cannot be created, or a subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| Error::Config(format!("Invalid log level {:?}: {e}", config.level)))?;

    let Some(log_file) = &config.file else {
        let installed = match config.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(std::io::stderr)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init(),
        };
        installed.map_err(|e| Error::Config(format!("Failed to install logger: {e}")))?;
        return Ok(None);
    };

    let directory = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let file_name = log_file
        .file_name()
        .ok_or_else(|| Error::Config(format!("Log file has no name: {}", log_file.display())))?;

    std::fs::create_dir_all(directory).map_err(|e| {
        Error::Config(format!(
            "Failed to create log directory {}: {e}",
            directory.display()
        ))
    })?;

    let appender = tracing_appender::rolling::daily(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(writer)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(writer)
            .try_init(),
    };
    installed.map_err(|e| Error::Config(format!("Failed to install logger: {e}")))?;

    Ok(Some(guard))
}
