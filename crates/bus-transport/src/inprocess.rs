//! # In-Process Transport
//!
//! Delivers events between participants of one process without
//! serialization. Payloads are shared, not copied.
//!
//! Each [`InProcessFactory`] owns one [`InProcessBus`]; participants see each
//! other when their connectors come from the same factory.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bus_converter::{ConverterSelection, WireType};
use bus_types::{Event, EventFilter, FilterAction, Scope};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::connector::{
    next_connector_id, Connector, EventSink, InConnector, Lifecycle, Observer, OutConnector,
    QualityOfServiceSpec, ScopePruner,
};
use crate::error::TransportError;
use crate::factory::{TransportFactory, TransportOptions};

pub const TRANSPORT_NAME: &str = "inprocess";

#[derive(Debug, Clone)]
struct Sink {
    scope: Scope,
    observer: Arc<Observer>,
    pruner: Arc<ScopePruner>,
}

/// Process-local event bus shared by in-process connectors.
#[derive(Debug, Default)]
pub struct InProcessBus {
    sinks: RwLock<HashMap<u64, Sink>>,
}

impl InProcessBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn add_sink(&self, id: u64, sink: Sink) {
        debug!(scope = %sink.scope, connector = id, "Adding in-process sink");
        self.sinks.write().insert(id, sink);
    }

    fn remove_sink(&self, id: u64) -> bool {
        self.sinks.write().remove(&id).is_some()
    }

    /// Deliver `event` to every sink whose scope contains the event scope.
    /// Returns the number of sinks that accepted it.
    pub fn handle(&self, event: &Event) -> usize {
        let targets: Vec<Sink> = self
            .sinks
            .read()
            .values()
            .filter(|sink| sink.scope.contains(&event.scope))
            .cloned()
            .collect();

        let mut delivered = 0;
        for sink in targets {
            if !sink.pruner.admits(&event.scope) {
                bus_telemetry::frame_dropped("filtered");
                continue;
            }
            let mut copy = event.clone();
            copy.meta_data.set_receive_time();
            if sink.observer.push(copy) {
                delivered += 1;
            }
        }
        trace!(scope = %event.scope, delivered, "In-process delivery");
        delivered
    }

    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }

    fn url() -> String {
        format!("inprocess://localhost:{}", std::process::id())
    }
}

/// Receiving in-process connector.
#[derive(Debug)]
pub struct InProcessInConnector {
    id: u64,
    bus: Arc<InProcessBus>,
    lifecycle: Lifecycle,
    observer: Arc<Observer>,
    pruner: Arc<ScopePruner>,
}

impl InProcessInConnector {
    #[must_use]
    pub fn new(bus: Arc<InProcessBus>) -> Self {
        Self {
            id: next_connector_id(),
            bus,
            lifecycle: Lifecycle::default(),
            observer: Arc::new(Observer::default()),
            pruner: Arc::new(ScopePruner::new()),
        }
    }
}

#[async_trait]
impl Connector for InProcessInConnector {
    fn transport_name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn wire_type(&self) -> WireType {
        WireType::Native
    }

    fn set_scope(&self, scope: Scope) -> Result<(), TransportError> {
        self.lifecycle.set_scope(scope)
    }

    fn set_quality_of_service(&self, qos: QualityOfServiceSpec) {
        self.lifecycle.set_qos(qos);
    }

    async fn activate(&self) -> Result<(), TransportError> {
        let scope = self.lifecycle.scope()?;
        if self.lifecycle.start() {
            self.bus.add_sink(
                self.id,
                Sink {
                    scope,
                    observer: Arc::clone(&self.observer),
                    pruner: Arc::clone(&self.pruner),
                },
            );
        }
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), TransportError> {
        if self.lifecycle.stop() {
            self.bus.remove_sink(self.id);
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    fn transport_url(&self) -> String {
        InProcessBus::url()
    }
}

impl InConnector for InProcessInConnector {
    fn set_observer(&self, sink: Option<EventSink>) {
        self.observer.set(sink);
    }

    fn filter_notify(&self, filter: &Arc<dyn EventFilter>, action: FilterAction) {
        self.pruner.apply(filter, action);
    }
}

/// Sending in-process connector.
#[derive(Debug)]
pub struct InProcessOutConnector {
    bus: Arc<InProcessBus>,
    lifecycle: Lifecycle,
}

impl InProcessOutConnector {
    #[must_use]
    pub fn new(bus: Arc<InProcessBus>) -> Self {
        Self {
            bus,
            lifecycle: Lifecycle::default(),
        }
    }
}

#[async_trait]
impl Connector for InProcessOutConnector {
    fn transport_name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn wire_type(&self) -> WireType {
        WireType::Native
    }

    fn set_scope(&self, scope: Scope) -> Result<(), TransportError> {
        self.lifecycle.set_scope(scope)
    }

    fn set_quality_of_service(&self, qos: QualityOfServiceSpec) {
        self.lifecycle.set_qos(qos);
    }

    async fn activate(&self) -> Result<(), TransportError> {
        self.lifecycle.start();
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), TransportError> {
        self.lifecycle.stop();
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    fn transport_url(&self) -> String {
        InProcessBus::url()
    }
}

#[async_trait]
impl OutConnector for InProcessOutConnector {
    async fn handle(&self, event: &Event) -> Result<(), TransportError> {
        if !self.lifecycle.is_active() {
            return Err(TransportError::NotActive);
        }
        if event.id.is_none() {
            return Err(TransportError::MissingEventId);
        }
        self.bus.handle(event);
        Ok(())
    }
}

/// Factory for the `inprocess` transport.
#[derive(Debug, Default)]
pub struct InProcessFactory {
    bus: Arc<InProcessBus>,
}

impl InProcessFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<InProcessBus> {
        &self.bus
    }
}

impl TransportFactory for InProcessFactory {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn wire_type(&self) -> WireType {
        WireType::Native
    }

    fn create_in_connector(
        &self,
        _converters: Arc<dyn ConverterSelection>,
        _options: &TransportOptions,
    ) -> Result<Arc<dyn InConnector>, TransportError> {
        Ok(Arc::new(InProcessInConnector::new(Arc::clone(&self.bus))))
    }

    fn create_out_connector(
        &self,
        _converters: Arc<dyn ConverterSelection>,
        _options: &TransportOptions,
    ) -> Result<Arc<dyn OutConnector>, TransportError> {
        Ok(Arc::new(InProcessOutConnector::new(Arc::clone(&self.bus))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_types::{EventId, Payload, ScopeFilter};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn scope(s: &str) -> Scope {
        Scope::new(s).unwrap()
    }

    fn event_on(s: &str, seq: u64) -> Event {
        let mut event = Event::new(scope(s), Payload::new(seq));
        event.id = Some(EventId::new(Uuid::nil(), seq));
        event
    }

    async fn listening(
        bus: &Arc<InProcessBus>,
        on: &str,
    ) -> (InProcessInConnector, mpsc::UnboundedReceiver<Event>) {
        let connector = InProcessInConnector::new(Arc::clone(bus));
        connector.set_scope(scope(on)).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        connector.set_observer(Some(tx));
        connector.activate().await.unwrap();
        (connector, rx)
    }

    #[tokio::test]
    async fn test_delivery_by_scope_containment() {
        let bus = Arc::new(InProcessBus::new());
        let (_a, mut rx_a) = listening(&bus, "/a").await;
        let (_c, mut rx_c) = listening(&bus, "/c").await;

        let out = InProcessOutConnector::new(Arc::clone(&bus));
        out.set_scope(scope("/a/b")).unwrap();
        out.activate().await.unwrap();
        out.handle(&event_on("/a/b", 1)).await.unwrap();

        let received = rx_a.try_recv().unwrap();
        assert_eq!(received.scope, scope("/a/b"));
        assert!(received.meta_data.receive_time.is_some());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_payload_is_shared_not_copied() {
        let bus = Arc::new(InProcessBus::new());
        let (_a, mut rx) = listening(&bus, "/").await;
        let event = event_on("/x", 3);
        bus.handle(&event);
        assert!(rx.try_recv().unwrap().payload.ptr_eq(&event.payload));
    }

    #[tokio::test]
    async fn test_deactivate_removes_sink_and_is_idempotent() {
        let bus = Arc::new(InProcessBus::new());
        let (connector, mut rx) = listening(&bus, "/a").await;
        assert_eq!(bus.sink_count(), 1);

        connector.deactivate().await.unwrap();
        connector.deactivate().await.unwrap();
        assert_eq!(bus.sink_count(), 0);
        assert_eq!(bus.handle(&event_on("/a", 1)), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_activate_requires_scope_and_locks_it() {
        let connector = InProcessInConnector::new(Arc::new(InProcessBus::new()));
        assert!(matches!(connector.activate().await, Err(TransportError::NoScope)));

        connector.set_scope(scope("/a")).unwrap();
        connector.activate().await.unwrap();
        assert!(matches!(
            connector.set_scope(scope("/b")),
            Err(TransportError::ScopeLocked)
        ));
    }

    #[tokio::test]
    async fn test_out_connector_requires_activation() {
        let out = InProcessOutConnector::new(Arc::new(InProcessBus::new()));
        assert!(matches!(
            out.handle(&event_on("/a", 1)).await,
            Err(TransportError::NotActive)
        ));
    }

    #[tokio::test]
    async fn test_filter_notify_prunes() {
        let bus = Arc::new(InProcessBus::new());
        let (connector, mut rx) = listening(&bus, "/").await;
        let filter: Arc<dyn EventFilter> = Arc::new(ScopeFilter::new(scope("/keep")));
        connector.filter_notify(&filter, FilterAction::Add);

        bus.handle(&event_on("/drop", 1));
        bus.handle(&event_on("/keep/me", 2));
        assert_eq!(rx.try_recv().unwrap().sequence_number(), Some(2));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_factory_shares_bus() {
        let factory = InProcessFactory::new();
        let converters: Arc<dyn ConverterSelection> =
            Arc::new(bus_converter::ConverterMap::new(WireType::Native));
        let options = TransportOptions::new();

        let input = factory
            .create_in_connector(Arc::clone(&converters), &options)
            .unwrap();
        input.set_scope(scope("/f")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        input.set_observer(Some(tx));
        input.activate().await.unwrap();

        let output = factory.create_out_connector(converters, &options).unwrap();
        output.set_scope(scope("/f")).unwrap();
        output.activate().await.unwrap();
        output.handle(&event_on("/f", 9)).await.unwrap();

        assert_eq!(rx.try_recv().unwrap().sequence_number(), Some(9));
        assert_eq!(factory.bus().sink_count(), 1);
    }
}
