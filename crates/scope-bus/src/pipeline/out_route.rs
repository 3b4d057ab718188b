//! Outbound routing: from an informer to its out-connectors.

use std::fmt;
use std::sync::Arc;

use bus_converter::{ConverterError, ConverterSelection, WireType};
use bus_telemetry::{metric_inc, EVENTS_PUBLISHED};
use bus_transport::OutConnector;
use bus_types::{Event, EventFilter, FilterAction, FilterChain};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::error::BusError;

/// An active out-connector and the converters it serializes with.
#[derive(Debug, Clone)]
pub struct OutBinding {
    pub connector: Arc<dyn OutConnector>,
    pub converters: Arc<dyn ConverterSelection>,
}

/// Hands outbound events to every out-connector of a participant.
pub struct OutRoute {
    bindings: Vec<OutBinding>,
    filters: RwLock<FilterChain>,
}

impl OutRoute {
    #[must_use]
    pub fn new(bindings: Vec<OutBinding>) -> Self {
        Self {
            bindings,
            filters: RwLock::new(FilterChain::new()),
        }
    }

    pub fn apply_filter(&self, filter: Arc<dyn EventFilter>, action: FilterAction) {
        self.filters.write().apply(filter, action);
    }

    #[must_use]
    pub fn bindings(&self) -> &[OutBinding] {
        &self.bindings
    }

    /// Send `event` through every connector.
    ///
    /// Returns `Ok(false)` without sending when an outbound filter rejects the
    /// event. A missing converter on any byte-oriented connector fails the
    /// call before anything is transmitted.
    pub async fn publish(&self, event: &mut Event) -> Result<bool, BusError> {
        if !self.filters.read().matches(event) {
            debug!(scope = %event.scope, "Event rejected by outbound filters");
            return Ok(false);
        }

        for binding in &self.bindings {
            if binding.converters.wire_type() == WireType::Bytes
                && !binding.converters.has_converter_for_data_type(event.data_type())
            {
                return Err(ConverterError::NoConverterForDataType(
                    event.data_type().to_string(),
                )
                .into());
            }
        }

        event.meta_data.set_send_time();
        for binding in &self.bindings {
            if let Err(e) = binding.connector.handle(event).await {
                warn!(
                    transport = binding.connector.transport_name(),
                    scope = %event.scope,
                    error = %e,
                    "Failed to send event"
                );
                return Err(e.into());
            }
            trace!(
                transport = binding.connector.transport_name(),
                scope = %event.scope,
                "Event handed to connector"
            );
        }
        metric_inc!(EVENTS_PUBLISHED);
        Ok(true)
    }

    /// Deactivate every connector, continuing past failures. Returns the
    /// first failure.
    pub async fn close(&self) -> Result<(), BusError> {
        let mut first = None;
        for binding in &self.bindings {
            if let Err(e) = binding.connector.deactivate().await {
                warn!(
                    transport = binding.connector.transport_name(),
                    error = %e,
                    "Failed to deactivate out-connector"
                );
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), |e| Err(e.into()))
    }
}

impl fmt::Debug for OutRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutRoute")
            .field("bindings", &self.bindings)
            .field("filters", &self.filters.read().len())
            .finish()
    }
}
