//! Structured logging setup.
//!
//! Installs a global `tracing` subscriber. `RUST_LOG` wins over the
//! configured level when set.

use crate::config::LoggingConfig;
use crate::error::{IcpError, Result};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber described by `config`.
///
/// Fails (without panicking) if a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| IcpError::ConfigError(format!("Failed to initialize logging: {e}")))?;
    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}
