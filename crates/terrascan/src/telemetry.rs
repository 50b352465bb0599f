//! Process-wide logging setup.
//!
//! Library code logs through both `tracing` (spans around ingest and job
//! work) and `log` (catalog and storage). Both end up in one `fmt`
//! subscriber filtered by `RUST_LOG`, or the configured level when unset.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("A global subscriber is already installed")]
    AlreadyInitialized,

    #[error("Failed to bridge log records: {0}")]
    LogBridge(#[from] log::SetLoggerError),
}

/// Builds the filter: `RUST_LOG` wins, otherwise the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| TelemetryError::InvalidFilter {
        directive: config.level.clone(),
        reason: e.to_string(),
    })
}

/// Installs the global subscriber. Call once, before any work starts.
pub fn init(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = env_filter(config)?;

    let (text, json) = match config.format {
        LogFormat::Text => (Some(fmt::layer().with_target(true)), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_current_span(true))),
    };
    let subscriber = Registry::default().with(filter).with(text).with(json);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| TelemetryError::AlreadyInitialized)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_configured_level_is_used_without_env() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "terrascan=debug,warn".to_string(),
            format: LogFormat::Text,
        };
        let filter = env_filter(&config).unwrap();
        assert!(filter.to_string().contains("terrascan=debug"));
    }

    #[test]
    #[serial]
    fn test_invalid_level() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "terrascan=notalevel".to_string(),
            format: LogFormat::Json,
        };
        assert!(matches!(
            env_filter(&config),
            Err(TelemetryError::InvalidFilter { .. })
        ));
    }
}
