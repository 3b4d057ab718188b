//! Structured logging setup.
//!
//! Installs a global `tracing` subscriber with an [`EnvFilter`] and either a
//! human readable or a JSON formatting layer.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::{TelemetryConfig, TelemetryError};

/// Install the global subscriber described by `config`.
///
/// Fails with [`TelemetryError::AlreadyInitialized`] if a global subscriber
/// is already set, which callers may treat as benign.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(&config.log_level)
        .map_err(|e| TelemetryError::Config(format!("invalid log filter: {e}")))?;

    let result = if config.json_logs {
        Registry::default()
            .with(filter)
            .with(fmt::layer().json().with_target(config.with_targets))
            .try_init()
    } else {
        Registry::default()
            .with(filter)
            .with(fmt::layer().compact().with_target(config.with_targets))
            .try_init()
    };
    result.map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        level = %config.log_level,
        json = config.json_logs,
        "Logging initialised"
    );
    Ok(())
}
