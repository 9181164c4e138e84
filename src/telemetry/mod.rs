//! Tracing subscriber setup
//!
//! ```text
//! Registry
//!   ├── EnvFilter (RUST_LOG, falling back to the requested level)
//!   └── Fmt Layer (stderr, plain or JSON)
//! ```
//!
//! Logs go to stderr so command output on stdout stays machine readable.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Telemetry errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("Failed to set global subscriber (may already be initialized): {0}")]
    AlreadyInitialized(String),
}

/// Build the filter: `RUST_LOG` wins, otherwise `level`
pub fn env_filter(level: &str) -> Result<EnvFilter, TelemetryError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).map_err(|e| TelemetryError::InvalidFilter {
            filter: level.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Install the global subscriber
pub fn init_subscriber(level: &str, json: bool) -> Result<(), TelemetryError> {
    let env_filter = env_filter(level)?;

    if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer);

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer);

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_env_filter_falls_back_to_level() {
        std::env::remove_var("RUST_LOG");
        assert!(env_filter("debug").is_ok());
        assert!(env_filter("preweave_uploadr=trace,info").is_ok());
    }

    #[test]
    #[serial_test::serial]
    fn test_invalid_level_rejected() {
        std::env::remove_var("RUST_LOG");
        assert!(matches!(
            env_filter("preweave_uploadr=loud"),
            Err(TelemetryError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn test_subscriber_init() {
        let result = init_subscriber("info", false);
        // May fail if subscriber already initialized, but that's ok for this test
        let _ = result;
    }
}
