//! Tracing subscriber setup.
//!
//! Human-readable stderr output plus an optional JSON file layer that rolls
//! daily, the same two-layer arrangement every labourlake entry point uses.

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// File name prefix for the JSON log file.
pub const LOG_FILE_PREFIX: &str = "labourlake.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{directive}': {message}")]
    Filter { directive: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Install the global subscriber.
///
/// Returns the file writer's guard when JSON file logging is enabled; keep it
/// alive for the life of the process or buffered lines are lost. Calling this
/// again after a subscriber is installed is a no-op that returns `Ok(None)`.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, LoggingError> {
    let filter = EnvFilter::try_new(&config.level).map_err(|e| LoggingError::Filter {
        directive: config.level.clone(),
        message: e.to_string(),
    })?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let (json_layer, guard) = match (&config.log_dir, config.json_file) {
        (Some(dir), true) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    match tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init()
    {
        Ok(()) => Ok(guard),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_rejected() {
        let config = LoggingConfig {
            level: "labourlake=notalevel".into(),
            ..LoggingConfig::default()
        };
        let err = init_logging(&config).unwrap_err();
        assert!(matches!(err, LoggingError::Filter { .. }));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = LoggingConfig {
            level: "debug".into(),
            json_file: true,
            log_dir: Some(dir.path().join("logs")),
        };
        let _first = init_logging(&config).unwrap();
        let second = init_logging(&config).unwrap();
        assert!(second.is_none());
        assert!(dir.path().join("logs").is_dir());
    }
}
