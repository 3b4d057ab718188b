//! # Bus Telemetry
//!
//! Logging and metrics for the scope bus.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bus_telemetry::{init_logging, register_metrics, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! init_logging(&config)?;
//! let metrics = register_metrics()?;
//! println!("{}", metrics.gather()?);
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BUS_SERVICE_NAME` | `scope-bus` | Service name in log lines |
//! | `BUS_LOG_LEVEL` | `info` | Log level filter (falls back to `RUST_LOG`) |
//! | `BUS_JSON_LOGS` | `false` | JSON formatted logs |
//! | `BUS_LOG_TARGETS` | `true` | Include targets in log lines |

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::init_logging;
pub use metrics::{
    frame_dropped, future_resolved, register_metrics, HistogramTimer, MetricsHandle,
    EVENTS_DELIVERED, EVENTS_PUBLISHED, FRAMES_DROPPED, FUTURES_RESOLVED, HANDLER_DURATION,
    HANDLER_ERRORS,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Logging already initialised: {0}")]
    AlreadyInitialized(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Convenience macro for recording a metric increment.
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr) => {
        $metric.inc()
    };
    ($metric:expr, $labels:expr) => {
        $metric.with_label_values($labels).inc()
    };
}
