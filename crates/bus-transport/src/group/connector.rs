//! Group communication in- and out-connectors.

use std::sync::Arc;

use async_trait::async_trait;
use bus_converter::{ConverterError, ConverterSelection, WireType};
use bus_types::{Event, EventFilter, FilterAction, Scope};
use parking_lot::Mutex;
use tracing::{info, warn};

use super::bus::{GroupBus, SharedGroupBus};
use super::{group_name, ServiceType, TRANSPORT_NAME};
use crate::connector::{
    next_connector_id, Connector, EventSink, InConnector, Lifecycle, Observer, OutConnector,
    QualityOfServiceSpec, ScopePruner,
};
use crate::error::TransportError;
use crate::sinks::ConvertingSink;

fn check_wire_type(converters: &dyn ConverterSelection) -> Result<(), TransportError> {
    match converters.wire_type() {
        WireType::Bytes => Ok(()),
        actual => Err(ConverterError::WireTypeMismatch {
            expected: WireType::Bytes,
            actual,
        }
        .into()),
    }
}

fn url_of(bus: &Mutex<Option<Arc<GroupBus>>>, shared: &SharedGroupBus) -> String {
    bus.lock()
        .as_ref()
        .map(|bus| bus.url())
        .unwrap_or_else(|| format!("group://{}", shared.backend_name()))
}

/// Receives the events of one scope from the group communication system.
#[derive(Debug)]
pub struct GroupInConnector {
    id: u64,
    shared: Arc<SharedGroupBus>,
    converters: Arc<dyn ConverterSelection>,
    lifecycle: Lifecycle,
    observer: Arc<Observer>,
    pruner: Arc<ScopePruner>,
    bus: Mutex<Option<Arc<GroupBus>>>,
}

impl GroupInConnector {
    pub(crate) fn new(
        shared: Arc<SharedGroupBus>,
        converters: Arc<dyn ConverterSelection>,
    ) -> Result<Self, TransportError> {
        check_wire_type(converters.as_ref())?;
        Ok(Self {
            id: next_connector_id(),
            shared,
            converters,
            lifecycle: Lifecycle::default(),
            observer: Arc::new(Observer::default()),
            pruner: Arc::new(ScopePruner::new()),
            bus: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Connector for GroupInConnector {
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
        let scope = self.lifecycle.scope()?;
        if self.lifecycle.is_active() {
            return Ok(());
        }
        let bus = self.shared.acquire().await?;
        bus.add_sink(
            self.id,
            ConvertingSink {
                scope: scope.clone(),
                observer: Arc::clone(&self.observer),
                pruner: Arc::clone(&self.pruner),
                converters: Arc::clone(&self.converters),
            },
        );
        if let Err(e) = bus.join(&group_name(&scope)).await {
            bus.remove_sink(self.id);
            self.shared.release(&bus).await;
            return Err(e);
        }
        info!(scope = %scope, url = %bus.url(), "Group in-connector activated");
        *self.bus.lock() = Some(bus);
        self.lifecycle.start();
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), TransportError> {
        self.lifecycle.stop();
        let bus = self.bus.lock().take();
        let Some(bus) = bus else {
            return Ok(());
        };
        bus.remove_sink(self.id);
        let left = match self.lifecycle.scope() {
            Ok(scope) => bus.leave(&group_name(&scope)).await,
            Err(e) => Err(e),
        };
        self.shared.release(&bus).await;
        if let Err(e) = &left {
            warn!(error = %e, "Failed to leave group");
        }
        left
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    fn transport_url(&self) -> String {
        url_of(&self.bus, &self.shared)
    }
}

impl InConnector for GroupInConnector {
    fn set_observer(&self, sink: Option<EventSink>) {
        self.observer.set(sink);
    }

    fn filter_notify(&self, filter: &Arc<dyn EventFilter>, action: FilterAction) {
        self.pruner.apply(filter, action);
    }
}

/// Sends events to the groups of their scope and its super scopes.
#[derive(Debug)]
pub struct GroupOutConnector {
    shared: Arc<SharedGroupBus>,
    converters: Arc<dyn ConverterSelection>,
    lifecycle: Lifecycle,
    bus: Mutex<Option<Arc<GroupBus>>>,
}

impl GroupOutConnector {
    pub(crate) fn new(
        shared: Arc<SharedGroupBus>,
        converters: Arc<dyn ConverterSelection>,
    ) -> Result<Self, TransportError> {
        check_wire_type(converters.as_ref())?;
        Ok(Self {
            shared,
            converters,
            lifecycle: Lifecycle::default(),
            bus: Mutex::new(None),
        })
    }

    /// Service type used for multicasts, derived from the QoS.
    #[must_use]
    pub fn service_type(&self) -> ServiceType {
        ServiceType::from(self.lifecycle.qos())
    }
}

#[async_trait]
impl Connector for GroupOutConnector {
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
        let bus = self.shared.acquire().await?;
        info!(url = %bus.url(), "Group out-connector activated");
        *self.bus.lock() = Some(bus);
        self.lifecycle.start();
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), TransportError> {
        self.lifecycle.stop();
        let bus = self.bus.lock().take();
        if let Some(bus) = bus {
            self.shared.release(&bus).await;
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    fn transport_url(&self) -> String {
        url_of(&self.bus, &self.shared)
    }
}

#[async_trait]
impl OutConnector for GroupOutConnector {
    async fn handle(&self, event: &Event) -> Result<(), TransportError> {
        let bus = self.bus.lock().clone().ok_or(TransportError::NotActive)?;
        bus.send(event, self.converters.as_ref(), self.service_type())
            .await
    }
}
