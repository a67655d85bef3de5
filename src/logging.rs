//! # Logging Setup
//!
//! Console logging through `tracing-subscriber`, plus an optional append-only
//! log file written through a non-blocking `tracing-appender` worker.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level. The returned guard must be held
/// until exit so buffered file output is flushed.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_ascii_lowercase()));

    let (file_layer, guard) = match file_writer(&config.file) {
        Some((writer, guard)) => (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

fn file_writer(
    file: &str,
) -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    if file.is_empty() {
        return None;
    }

    let path = Path::new(file);
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let name = path.file_name()?;

    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("Cannot create log directory {}: {}", dir.display(), e);
        return None;
    }

    let appender = tracing_appender::rolling::never(dir, name);
    Some(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_disables_file_logging() {
        assert!(file_writer("").is_none());
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("logs").join("gateway.log");
        let writer = file_writer(file.to_str().unwrap());
        assert!(writer.is_some());
        assert!(dir.path().join("logs").is_dir());
    }
}
