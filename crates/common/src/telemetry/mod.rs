//! Tracing subscriber setup
//!
//! The crates only emit `tracing` events; an application calls
//! [`init_tracing`] once at startup to decide where they go.

use crate::config::ObservabilityConfig;
use crate::errors::{AppError, Result};
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `log_level`. Returns `false` when a
/// global subscriber was already installed and is kept.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<bool> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| AppError::configuration(format!("invalid log level: {}", e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json_logging {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
        return Ok(false);
    }

    tracing::info!(
        service = %config.service_name,
        version = crate::VERSION,
        "Tracing initialized"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = ObservabilityConfig {
            json_logging: false,
            ..ObservabilityConfig::default()
        };
        init_tracing(&config).unwrap();
        assert!(!init_tracing(&config).unwrap());
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        let config = ObservabilityConfig {
            log_level: "kbforge=notalevel".into(),
            ..ObservabilityConfig::default()
        };
        if std::env::var("RUST_LOG").is_err() {
            assert!(init_tracing(&config).is_err());
        }
    }
}
