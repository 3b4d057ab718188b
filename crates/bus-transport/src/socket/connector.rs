//! Socket in- and out-connectors.

use std::sync::Arc;

use async_trait::async_trait;
use bus_converter::{ConverterSelection, WireType};
use bus_types::{Event, EventFilter, FilterAction, Scope};
use parking_lot::Mutex;
use tracing::info;

use super::bus::SocketBus;
use super::{BusRegistry, SocketOptions, TRANSPORT_NAME};
use crate::connector::{
    next_connector_id, Connector, EventSink, InConnector, Lifecycle, Observer, OutConnector,
    QualityOfServiceSpec, ScopePruner,
};
use crate::error::TransportError;
use crate::sinks::ConvertingSink;

fn require_bytes(converters: &dyn ConverterSelection) -> Result<(), TransportError> {
    if converters.wire_type() != WireType::Bytes {
        return Err(bus_converter::ConverterError::WireTypeMismatch {
            expected: WireType::Bytes,
            actual: converters.wire_type(),
        }
        .into());
    }
    Ok(())
}

fn url_of(bus: &Mutex<Option<Arc<SocketBus>>>, options: &SocketOptions) -> String {
    bus.lock()
        .as_ref()
        .map(|bus| bus.url())
        .unwrap_or_else(|| format!("socket://{}:{}", options.host, options.port))
}

/// Receives events from a socket bus.
#[derive(Debug)]
pub struct SocketInConnector {
    id: u64,
    registry: Arc<BusRegistry>,
    options: SocketOptions,
    converters: Arc<dyn ConverterSelection>,
    lifecycle: Lifecycle,
    observer: Arc<Observer>,
    pruner: Arc<ScopePruner>,
    bus: Mutex<Option<Arc<SocketBus>>>,
}

impl SocketInConnector {
    pub(crate) fn new(
        registry: Arc<BusRegistry>,
        options: SocketOptions,
        converters: Arc<dyn ConverterSelection>,
    ) -> Result<Self, TransportError> {
        require_bytes(converters.as_ref())?;
        Ok(Self {
            id: next_connector_id(),
            registry,
            options,
            converters,
            lifecycle: Lifecycle::default(),
            observer: Arc::new(Observer::default()),
            pruner: Arc::new(ScopePruner::new()),
            bus: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Connector for SocketInConnector {
    fn transport_name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn wire_type(&self) -> WireType {
        WireType::Bytes
    }

    fn set_scope(&self, scope: Scope) -> Result<(), TransportError> {
        self.lifecycle.set_scope(scope)
    }

    fn set_quality_of_service(&self, qos: QualityOfServiceSpec) {
        // TCP delivers in order and reliably whatever is requested.
        self.lifecycle.set_qos(qos);
    }

    async fn activate(&self) -> Result<(), TransportError> {
        let scope = self.lifecycle.scope()?;
        if self.lifecycle.is_active() {
            return Ok(());
        }
        let bus = self.registry.acquire(&self.options).await?;
        bus.add_sink(
            self.id,
            ConvertingSink {
                scope: scope.clone(),
                observer: Arc::clone(&self.observer),
                pruner: Arc::clone(&self.pruner),
                converters: Arc::clone(&self.converters),
            },
        );
        info!(scope = %scope, url = %bus.url(), "Socket in-connector activated");
        *self.bus.lock() = Some(bus);
        self.lifecycle.start();
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), TransportError> {
        self.lifecycle.stop();
        let bus = self.bus.lock().take();
        if let Some(bus) = bus {
            bus.remove_sink(self.id);
            self.registry.release(&bus).await;
            info!(url = %bus.url(), "Socket in-connector deactivated");
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    fn transport_url(&self) -> String {
        url_of(&self.bus, &self.options)
    }
}

impl InConnector for SocketInConnector {
    fn set_observer(&self, sink: Option<EventSink>) {
        self.observer.set(sink);
    }

    fn filter_notify(&self, filter: &Arc<dyn EventFilter>, action: FilterAction) {
        self.pruner.apply(filter, action);
    }
}

/// Publishes events on a socket bus.
#[derive(Debug)]
pub struct SocketOutConnector {
    registry: Arc<BusRegistry>,
    options: SocketOptions,
    converters: Arc<dyn ConverterSelection>,
    lifecycle: Lifecycle,
    bus: Mutex<Option<Arc<SocketBus>>>,
}

impl SocketOutConnector {
    pub(crate) fn new(
        registry: Arc<BusRegistry>,
        options: SocketOptions,
        converters: Arc<dyn ConverterSelection>,
    ) -> Result<Self, TransportError> {
        require_bytes(converters.as_ref())?;
        Ok(Self {
            registry,
            options,
            converters,
            lifecycle: Lifecycle::default(),
            bus: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Connector for SocketOutConnector {
    fn transport_name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn wire_type(&self) -> WireType {
        WireType::Bytes
    }

    fn set_scope(&self, scope: Scope) -> Result<(), TransportError> {
        self.lifecycle.set_scope(scope)
    }

    fn set_quality_of_service(&self, qos: QualityOfServiceSpec) {
        self.lifecycle.set_qos(qos);
    }

    async fn activate(&self) -> Result<(), TransportError> {
        if self.lifecycle.is_active() {
            return Ok(());
        }
        let bus = self.registry.acquire(&self.options).await?;
        info!(url = %bus.url(), "Socket out-connector activated");
        *self.bus.lock() = Some(bus);
        self.lifecycle.start();
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), TransportError> {
        self.lifecycle.stop();
        let bus = self.bus.lock().take();
        if let Some(bus) = bus {
            self.registry.release(&bus).await;
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    fn transport_url(&self) -> String {
        url_of(&self.bus, &self.options)
    }
}

#[async_trait]
impl OutConnector for SocketOutConnector {
    async fn handle(&self, event: &Event) -> Result<(), TransportError> {
        let bus = self.bus.lock().clone().ok_or(TransportError::NotActive)?;
        bus.publish(event, self.converters.as_ref())
    }
}
