//! Observability module for fedserve.
//!
//! Installs the global `tracing` subscriber used by the library and the CLI.

use crate::config::ObservabilityConfig;
use crate::error::{FedServeError, Result};
use ::tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| FedServeError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer().with_target(false))
            .try_init()
            .map_err(|e| FedServeError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    debug!(level = %config.log_level, json = config.json_logs, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = ObservabilityConfig::default();
        // Another test may have installed a subscriber already; either way the
        // second call in this process must be rejected.
        let _ = init(&config);
        assert!(matches!(init(&config), Err(FedServeError::Internal(_))));
    }
}
