//! Tracing subscriber setup.

use crate::errors::SketchflowError;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format of the process log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Builds the env filter: `RUST_LOG` when set, otherwise `default_level`.
#[must_use]
pub fn env_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.as_str()))
}

/// Installs the global subscriber.
///
/// Fails when a subscriber is already installed.
pub fn init_tracing(format: LogFormat, default_level: Level) -> Result<(), SketchflowError> {
    let registry = tracing_subscriber::registry().with(env_filter(default_level));
    let result = match format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
    };
    result.map_err(|e| SketchflowError::Internal(format!("tracing init: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parses_from_cli_value() {
        use clap::ValueEnum;
        assert_eq!(LogFormat::from_str("json", true), Ok(LogFormat::Json));
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init_tracing(LogFormat::Pretty, Level::WARN);
        assert!(init_tracing(LogFormat::Json, Level::WARN).is_err());
    }
}
