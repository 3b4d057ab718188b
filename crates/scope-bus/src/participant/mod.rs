//! # Participants
//!
//! | Participant | Role |
//! |-------------|------|
//! | [`Informer`] | publishes events on a scope |
//! | [`Listener`] | pushes received events to subscription handlers |
//! | [`Reader`] | queues received events for pull-based consumption |
//!
//! Participants are created by the [`Bus`](crate::Bus). Creation activates
//! one connector per enabled transport; if any activation fails, the
//! connectors activated so far are released again.

mod informer;
mod listener;
mod reader;

use std::sync::Arc;

use bus_converter::{ConverterMap, ConverterSelection, WireType};
use bus_transport::{
    Connector, EventSink, InConnector, QualityOfServiceSpec, TransportFactory, TransportRegistry,
};
use bus_types::{DataType, Scope};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{converters_for_transport, ParticipantConfig, TransportConfig};
use crate::error::BusError;
use crate::pipeline::{spawn_pump, HandlerErrorReport, InRoute, OutBinding, OutRoute};

pub use informer::Informer;
pub use listener::{Listener, Subscription};
pub use reader::Reader;

/// What participants are built from: transports, the base converter map and
/// the handler error channel.
#[derive(Debug, Clone)]
pub(crate) struct ParticipantContext {
    transports: Arc<TransportRegistry>,
    converters: Arc<ConverterMap>,
    errors: broadcast::Sender<HandlerErrorReport>,
}

impl ParticipantContext {
    pub(crate) fn new(
        transports: Arc<TransportRegistry>,
        converters: Arc<ConverterMap>,
        errors: broadcast::Sender<HandlerErrorReport>,
    ) -> Self {
        Self {
            transports,
            converters,
            errors,
        }
    }

    pub(crate) fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    pub(crate) fn converters(&self) -> &ConverterMap {
        &self.converters
    }

    pub(crate) fn errors(&self) -> &broadcast::Sender<HandlerErrorReport> {
        &self.errors
    }

    fn converters_for(
        &self,
        factory: &dyn TransportFactory,
        transport: &TransportConfig,
    ) -> Result<Arc<dyn ConverterSelection>, BusError> {
        match factory.wire_type() {
            WireType::Native => Ok(Arc::new(ConverterMap::new(WireType::Native))),
            WireType::Bytes => Ok(converters_for_transport(transport, &self.converters)?),
        }
    }

    async fn open_out(
        &self,
        transport: &TransportConfig,
        scope: &Scope,
        qos: QualityOfServiceSpec,
    ) -> Result<OutBinding, BusError> {
        let factory = self.transports.get(&transport.name)?;
        let converters = self.converters_for(factory.as_ref(), transport)?;
        let connector =
            factory.create_out_connector(Arc::clone(&converters), &transport.options)?;
        connector.set_scope(scope.clone())?;
        connector.set_quality_of_service(qos);
        activate(connector.as_ref()).await?;
        Ok(OutBinding {
            connector,
            converters,
        })
    }

    async fn open_in(
        &self,
        transport: &TransportConfig,
        scope: &Scope,
        qos: QualityOfServiceSpec,
        sink: EventSink,
    ) -> Result<Arc<dyn InConnector>, BusError> {
        let factory = self.transports.get(&transport.name)?;
        let converters = self.converters_for(factory.as_ref(), transport)?;
        let connector = factory.create_in_connector(converters, &transport.options)?;
        connector.set_scope(scope.clone())?;
        connector.set_quality_of_service(qos);
        connector.set_observer(Some(sink));
        if let Err(e) = activate(connector.as_ref()).await {
            connector.set_observer(None);
            return Err(e);
        }
        Ok(connector)
    }

    /// Create an informer on `scope`. `data_type` restricts the payloads it
    /// accepts; `None` accepts any.
    pub(crate) async fn informer(
        &self,
        scope: Scope,
        data_type: Option<DataType>,
        config: &ParticipantConfig,
    ) -> Result<Informer, BusError> {
        let mut bindings = Vec::new();
        for transport in config.enabled_transports() {
            match self.open_out(transport, &scope, config.qos).await {
                Ok(binding) => bindings.push(binding),
                Err(e) => {
                    // Already failing; the original error is the one to report.
                    let _ = OutRoute::new(bindings).close().await;
                    return Err(e);
                }
            }
        }
        if bindings.is_empty() {
            return Err(BusError::NoTransports);
        }
        let informer = Informer::new(Uuid::new_v4(), scope, data_type, OutRoute::new(bindings));
        debug!(
            participant = %informer.id(),
            scope = %informer.scope(),
            "Informer created"
        );
        Ok(informer)
    }

    /// Create a listener on `scope`.
    pub(crate) async fn listener(
        &self,
        scope: Scope,
        config: &ParticipantConfig,
    ) -> Result<Listener, BusError> {
        let (sink, events) = mpsc::unbounded_channel();
        let mut connectors: Vec<Arc<dyn InConnector>> = Vec::new();
        for transport in config.enabled_transports() {
            match self.open_in(transport, &scope, config.qos, sink.clone()).await {
                Ok(connector) => connectors.push(connector),
                Err(e) => {
                    let _ = release_in(&connectors).await;
                    return Err(e);
                }
            }
        }
        if connectors.is_empty() {
            return Err(BusError::NoTransports);
        }

        let route = Arc::new(InRoute::new(self.errors.clone()));
        let pump = spawn_pump(events, Arc::clone(&route));
        let listener = Listener::new(
            Uuid::new_v4(),
            scope,
            route,
            connectors,
            pump,
            self.errors.clone(),
        );
        debug!(
            participant = %listener.id(),
            scope = %listener.scope(),
            "Listener created"
        );
        Ok(listener)
    }
}

/// Activate `connector`, releasing whatever it acquired if that fails.
async fn activate<C: Connector + ?Sized>(connector: &C) -> Result<(), BusError> {
    if let Err(e) = connector.activate().await {
        warn!(
            transport = connector.transport_name(),
            error = %e,
            "Connector activation failed"
        );
        if let Err(cleanup) = connector.deactivate().await {
            debug!(error = %cleanup, "Cleanup after failed activation also failed");
        }
        return Err(e.into());
    }
    Ok(())
}

/// Detach and deactivate in-connectors, continuing past failures. Returns
/// the first failure.
pub(crate) async fn release_in(connectors: &[Arc<dyn InConnector>]) -> Result<(), BusError> {
    let mut first = None;
    for connector in connectors {
        connector.set_observer(None);
        if let Err(e) = connector.deactivate().await {
            warn!(
                transport = connector.transport_name(),
                error = %e,
                "Failed to deactivate in-connector"
            );
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), |e| Err(e.into()))
}
