//! Structured logging setup.
//!
//! The library itself only emits `tracing` events. Binaries and tests that want them
//! printed call [`init_logging`] once at startup.

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::Result;

/// Install a global `tracing` subscriber configured from `config`.
///
/// `RUST_LOG` overrides the configured level when set. Once a global subscriber
/// exists, further calls leave it in place and return `Ok`.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    match installed {
        Ok(()) => info!(app = %config.app_name, level = %config.log_level, "Logging initialized"),
        Err(e) => debug!(error = %e, "Subscriber already installed, keeping it"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&LoggingConfig {
            json_format: true,
            ..LoggingConfig::default()
        })
        .is_ok());
    }
}
