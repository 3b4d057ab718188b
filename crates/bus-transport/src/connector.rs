//! # Connector Contract
//!
//! Every transport plugs into the bus through the same two roles:
//!
//! - an [`OutConnector`] accepts ready-to-send events and transmits them,
//! - an [`InConnector`] receives wire frames, converts them back into events
//!   and pushes those into the [`EventSink`] supplied by the pipeline.
//!
//! ```text
//!   pipeline ──handle(&Event)──► OutConnector ──wire──► InConnector ──EventSink──► pipeline
//! ```
//!
//! Connectors are shared behind `Arc` and use interior mutability; lifecycle
//! calls take `&self`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bus_converter::WireType;
use bus_types::{Event, EventFilter, FilterAction, Scope};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Channel through which in-connectors hand received events to the pipeline.
pub type EventSink = mpsc::UnboundedSender<Event>;

/// Ordering requirement for delivered events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryOrdering {
    #[default]
    Unordered,
    /// Events of one sender arrive in send order.
    Ordered,
}

/// Reliability requirement for delivered events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reliability {
    Unreliable,
    #[default]
    Reliable,
}

/// Quality of service requested from a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QualityOfServiceSpec {
    pub ordering: DeliveryOrdering,
    pub reliability: Reliability,
}

impl QualityOfServiceSpec {
    #[must_use]
    pub fn new(ordering: DeliveryOrdering, reliability: Reliability) -> Self {
        Self {
            ordering,
            reliability,
        }
    }
}

/// Lifecycle shared by in- and out-connectors.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Name of the transport this connector belongs to.
    fn transport_name(&self) -> &str;

    /// Wire type of the converters this connector uses.
    fn wire_type(&self) -> WireType;

    /// Scope the connector serves. Must be set before activation.
    fn set_scope(&self, scope: Scope) -> Result<(), TransportError>;

    fn set_quality_of_service(&self, qos: QualityOfServiceSpec);

    /// Acquire transport resources.
    async fn activate(&self) -> Result<(), TransportError>;

    /// Release all transport resources, also after a failed activation.
    /// Calling it on an inactive connector is a no-op.
    async fn deactivate(&self) -> Result<(), TransportError>;

    fn is_active(&self) -> bool;

    /// URL describing the transport endpoint, e.g. `socket://localhost:55555`.
    fn transport_url(&self) -> String;
}

/// Sending side of a transport.
#[async_trait]
pub trait OutConnector: Connector {
    /// Serialize and transmit `event`.
    ///
    /// The event must carry an id. Conversion errors are returned before
    /// anything is transmitted.
    async fn handle(&self, event: &Event) -> Result<(), TransportError>;
}

/// Receiving side of a transport.
pub trait InConnector: Connector {
    /// Install (or remove) the sink received events are pushed to.
    fn set_observer(&self, sink: Option<EventSink>);

    /// A subscription filter was added or removed. Connectors may use this to
    /// drop traffic no subscription can accept.
    fn filter_notify(&self, filter: &Arc<dyn EventFilter>, action: FilterAction);
}

/// Scope-based traffic pruning for in-connectors.
///
/// Tracks the scopes of scope-restricting subscription filters. While at
/// least one such filter is present, events outside all of them are dropped.
/// Without scope filters everything is admitted.
#[derive(Debug, Default)]
pub struct ScopePruner {
    scopes: Mutex<Vec<Scope>>,
}

impl ScopePruner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, filter: &Arc<dyn EventFilter>, action: FilterAction) {
        let Some(scope) = filter.scope() else {
            return;
        };
        let mut scopes = self.scopes.lock();
        match action {
            FilterAction::Add => scopes.push(scope.clone()),
            FilterAction::Remove => {
                if let Some(pos) = scopes.iter().position(|s| s == scope) {
                    scopes.remove(pos);
                }
            }
        }
    }

    #[must_use]
    pub fn admits(&self, scope: &Scope) -> bool {
        let scopes = self.scopes.lock();
        scopes.is_empty() || scopes.iter().any(|s| s.contains(scope))
    }
}

static NEXT_CONNECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id used to key connectors in shared transport state.
pub(crate) fn next_connector_id() -> u64 {
    NEXT_CONNECTOR_ID.fetch_add(1, Ordering::Relaxed)
}

/// Scope, activity flag and QoS common to all connector implementations.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    inner: Mutex<LifecycleState>,
}

#[derive(Debug, Default)]
struct LifecycleState {
    scope: Option<Scope>,
    active: bool,
    qos: QualityOfServiceSpec,
}

impl Lifecycle {
    pub(crate) fn set_scope(&self, scope: Scope) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        if state.active {
            return Err(TransportError::ScopeLocked);
        }
        state.scope = Some(scope);
        Ok(())
    }

    pub(crate) fn scope(&self) -> Result<Scope, TransportError> {
        self.inner.lock().scope.clone().ok_or(TransportError::NoScope)
    }

    pub(crate) fn set_qos(&self, qos: QualityOfServiceSpec) {
        self.inner.lock().qos = qos;
    }

    pub(crate) fn qos(&self) -> QualityOfServiceSpec {
        self.inner.lock().qos
    }

    /// Mark active. Returns false if the connector already was.
    pub(crate) fn start(&self) -> bool {
        !std::mem::replace(&mut self.inner.lock().active, true)
    }

    /// Mark inactive. Returns false if the connector already was.
    pub(crate) fn stop(&self) -> bool {
        std::mem::replace(&mut self.inner.lock().active, false)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.inner.lock().active
    }
}

/// Observer slot shared by the in-connector implementations.
#[derive(Debug, Default)]
pub(crate) struct Observer {
    sink: Mutex<Option<EventSink>>,
}

impl Observer {
    pub(crate) fn set(&self, sink: Option<EventSink>) {
        *self.sink.lock() = sink;
    }

    /// Push `event` to the installed sink. Returns false if there is none or
    /// the pipeline has gone away.
    pub(crate) fn push(&self, event: Event) -> bool {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_types::{MethodFilter, Payload, ScopeFilter};

    fn scope(s: &str) -> Scope {
        Scope::new(s).unwrap()
    }

    #[test]
    fn test_pruner_admits_everything_without_scope_filters() {
        let pruner = ScopePruner::new();
        assert!(pruner.admits(&scope("/any")));

        let method: Arc<dyn EventFilter> = Arc::new(MethodFilter::new("REQUEST"));
        pruner.apply(&method, FilterAction::Add);
        assert!(pruner.admits(&scope("/any")));
    }

    #[test]
    fn test_pruner_tracks_scope_filters() {
        let pruner = ScopePruner::new();
        let filter: Arc<dyn EventFilter> = Arc::new(ScopeFilter::new(scope("/a")));
        pruner.apply(&filter, FilterAction::Add);
        assert!(pruner.admits(&scope("/a/b")));
        assert!(!pruner.admits(&scope("/c")));

        pruner.apply(&filter, FilterAction::Remove);
        assert!(pruner.admits(&scope("/c")));
    }

    #[test]
    fn test_observer_push() {
        let observer = Observer::default();
        let event = Event::new(scope("/a"), Payload::empty());
        assert!(!observer.push(event.clone()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        observer.set(Some(tx));
        assert!(observer.push(event));
        assert_eq!(rx.try_recv().unwrap().scope, scope("/a"));
    }

    #[test]
    fn test_default_qos() {
        let qos = QualityOfServiceSpec::default();
        assert_eq!(qos.ordering, DeliveryOrdering::Unordered);
        assert_eq!(qos.reliability, Reliability::Reliable);
    }
}
