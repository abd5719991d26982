//! # Structured Logging
//!
//! Installs the global `tracing` subscriber: an `EnvFilter`, a JSON or text
//! console layer and an optional daily rolling log file.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::types::{Error, Result};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset (e.g. `info`,
    /// `self_healing=debug`)
    pub level: String,
    /// Names the log file
    pub service_name: String,
    pub json_format: bool,
    /// Also write logs to a daily rolling file under `log_dir`
    pub file_output: bool,
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "self-healing".to_string(),
            json_format: true,
            file_output: false,
            log_dir: None,
        }
    }
}

/// Initializes the structured logging system.
///
/// Returns the file writer's guard when file output is enabled; keep it
/// alive for as long as logs should be flushed. A second call is a no-op.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    if LOGGING_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(None);
    }

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
            Error::Logging(format!("invalid log level {:?}: {}", config.level, e))
        })?,
    };

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
    });
    let text_layer = (!config.json_format).then(|| fmt::layer().with_target(true).with_thread_ids(true));

    let (file_layer, guard) = match (config.file_output, config.log_dir.as_deref()) {
        (true, Some(log_dir)) => {
            let appender = tracing_appender::rolling::daily(log_dir, format!("{}.log", config.service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        _ => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
            Error::Logging(format!("Failed to set global subscriber: {}", e))
        })?;

    tracing::info!(
        service = %config.service_name,
        log_level = %config.level,
        json = %config.json_format,
        file_output = %guard.is_some(),
        "Structured logging initialized"
    );

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.json_format);
        assert!(!config.file_output);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: LoggingConfig = serde_json::from_str(r#"{"level": "debug", "json_format": false}"#).unwrap();
        assert_eq!(config.level, "debug");
        assert!(!config.json_format);
        assert_eq!(config.service_name, "self-healing");
    }
}
