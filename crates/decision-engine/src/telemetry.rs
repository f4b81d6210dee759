//! Tracing subscriber setup for binaries embedding the engine.

use crate::config::TelemetryConfig;
use crate::error::{EngineError, Result};
use tracing_subscriber::EnvFilter;

/// Installs a compact fmt subscriber. `RUST_LOG` wins over the configured
/// level when it is set and valid.
pub fn init(config: &TelemetryConfig) -> Result<()> {
    let filter = build_filter(config)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .with_ansi(false)
        .try_init()
        .map_err(|err| EngineError::Config(format!("telemetry: {}", err)))
}

fn build_filter(config: &TelemetryConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|err| {
            EngineError::Config(format!(
                "invalid log level/filter '{}': {}",
                config.log_level, err
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_filter_parses() {
        let config = TelemetryConfig {
            log_level: "info,decision_engine::audit=debug".to_string(),
        };
        assert!(EnvFilter::try_new(&config.log_level).is_ok());
    }

    #[test]
    fn test_build_filter_falls_back_to_config() {
        let config = TelemetryConfig {
            log_level: "debug".to_string(),
        };
        assert!(build_filter(&config).is_ok());
    }
}
