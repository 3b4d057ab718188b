//! Prometheus metrics for the bus.
//!
//! All metrics follow the naming convention `bus_<metric>_<unit>`.
//! Counters are process-wide; they start counting as soon as they are first
//! touched, whether or not [`register_metrics`] has been called.

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Metrics registry owned by the bus
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // EVENT FLOW
    // =========================================================================

    /// Events handed to out-connectors
    pub static ref EVENTS_PUBLISHED: IntCounter = IntCounter::new(
        "bus_events_published_total",
        "Total number of events published"
    ).expect("metric creation failed");

    /// Events delivered to subscription handlers
    pub static ref EVENTS_DELIVERED: IntCounter = IntCounter::new(
        "bus_events_delivered_total",
        "Total number of events delivered to handlers"
    ).expect("metric creation failed");

    /// Time spent inside subscription handlers
    pub static ref HANDLER_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "bus_handler_duration_seconds",
            "Time spent in subscription handlers"
        ).buckets(exponential_buckets(0.0001, 2.0, 16).expect("bucket creation failed"))
    ).expect("metric creation failed");

    // =========================================================================
    // FAILURES
    // =========================================================================

    /// Handler invocations that returned an error or panicked
    pub static ref HANDLER_ERRORS: IntCounter = IntCounter::new(
        "bus_handler_errors_total",
        "Total number of failed handler invocations"
    ).expect("metric creation failed");

    /// Inbound frames dropped before delivery
    pub static ref FRAMES_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("bus_frames_dropped_total", "Total inbound frames dropped"),
        &["reason"]  // decode, conversion, assembly, oversized, filtered
    ).expect("metric creation failed");

    // =========================================================================
    // REQUEST / REPLY
    // =========================================================================

    /// Futures reaching a terminal state
    pub static ref FUTURES_RESOLVED: IntCounterVec = IntCounterVec::new(
        Opts::new("bus_futures_resolved_total", "Total futures resolved"),
        &["outcome"]  // fulfilled, failed, timeout, cancelled
    ).expect("metric creation failed");
}

/// Handle to the bus metrics registry.
#[derive(Clone)]
pub struct MetricsHandle {
    registry: Registry,
}

impl MetricsHandle {
    /// Encode all registered metrics in the Prometheus text format.
    pub fn gather(&self) -> Result<String, TelemetryError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
    }
}

/// Register all bus metrics with [`REGISTRY`].
///
/// Safe to call repeatedly; metrics that are already registered are kept.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(EVENTS_PUBLISHED.clone()),
        Box::new(EVENTS_DELIVERED.clone()),
        Box::new(HANDLER_DURATION.clone()),
        Box::new(HANDLER_ERRORS.clone()),
        Box::new(FRAMES_DROPPED.clone()),
        Box::new(FUTURES_RESOLVED.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        registry: REGISTRY.clone(),
    })
}

/// Record a dropped inbound frame.
pub fn frame_dropped(reason: &str) {
    FRAMES_DROPPED.with_label_values(&[reason]).inc();
}

/// Record a future reaching a terminal state.
pub fn future_resolved(outcome: &str) {
    FUTURES_RESOLVED.with_label_values(&[outcome]).inc();
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}
