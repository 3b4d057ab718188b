//! Push-based receiving participant.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bus_transport::InConnector;
use bus_types::{EventFilter, FilterAction, FilterChain, Scope};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::release_in;
use crate::error::BusError;
use crate::handler::Handler;
use crate::pipeline::{HandlerErrorReport, InRoute};

/// Handle of one subscription.
///
/// Dropping the handle keeps the subscription; end it with
/// [`Subscription::unsubscribe`] or [`Listener::unsubscribe`].
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    scope: Scope,
    route: Weak<InRoute>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Scope of the listener the subscription belongs to.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Stop delivery. Returns false if the subscription had already ended.
    pub fn unsubscribe(&self) -> bool {
        self.route
            .upgrade()
            .is_some_and(|route| route.unsubscribe(self.id))
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Receives the events of a scope and its sub-scopes and pushes them to
/// subscription handlers.
///
/// Listener-wide filters apply before every subscription and are forwarded
/// to the in-connectors, which may use scope filters to drop traffic early.
pub struct Listener {
    id: Uuid,
    scope: Scope,
    route: Arc<InRoute>,
    connectors: Vec<Arc<dyn InConnector>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    errors: broadcast::Sender<HandlerErrorReport>,
    active: AtomicBool,
}

impl Listener {
    pub(crate) fn new(
        id: Uuid,
        scope: Scope,
        route: Arc<InRoute>,
        connectors: Vec<Arc<dyn InConnector>>,
        pump: JoinHandle<()>,
        errors: broadcast::Sender<HandlerErrorReport>,
    ) -> Self {
        Self {
            id,
            scope,
            route,
            connectors,
            pump: Mutex::new(Some(pump)),
            errors,
            active: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Deliver events matching `filters` to `handler`.
    pub fn subscribe<H>(&self, filters: FilterChain, handler: H) -> Result<Subscription, BusError>
    where
        H: Handler + 'static,
    {
        self.subscribe_handler(filters, Arc::new(handler))
    }

    pub fn subscribe_handler(
        &self,
        filters: FilterChain,
        handler: Arc<dyn Handler>,
    ) -> Result<Subscription, BusError> {
        if !self.is_active() {
            return Err(BusError::Closed);
        }
        let id = self.route.subscribe(filters, handler);
        Ok(Subscription {
            id,
            scope: self.scope.clone(),
            route: Arc::downgrade(&self.route),
        })
    }

    /// Returns false if the subscription had already ended or belongs to
    /// another listener.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.route.unsubscribe(subscription.id)
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.route.subscription_count()
    }

    /// Add a filter applied to every subscription of this listener.
    pub fn add_filter(&self, filter: Arc<dyn EventFilter>) {
        self.apply_filter(filter, FilterAction::Add);
    }

    pub fn remove_filter(&self, filter: Arc<dyn EventFilter>) {
        self.apply_filter(filter, FilterAction::Remove);
    }

    fn apply_filter(&self, filter: Arc<dyn EventFilter>, action: FilterAction) {
        for connector in &self.connectors {
            connector.filter_notify(&filter, action);
        }
        self.route.apply_filter(filter, action);
    }

    /// Failed handler invocations of every subscription on the bus this
    /// listener belongs to.
    #[must_use]
    pub fn handler_errors(&self) -> broadcast::Receiver<HandlerErrorReport> {
        self.errors.subscribe()
    }

    /// Detach from all transports and end every subscription. Calling it
    /// again is a no-op.
    pub async fn deactivate(&self) -> Result<(), BusError> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(participant = %self.id, scope = %self.scope, "Deactivating listener");
        self.route.close();
        let released = release_in(&self.connectors).await;
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        released
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("connectors", &self.connectors.len())
            .field("subscriptions", &self.subscription_count())
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.route.close();
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let connectors = std::mem::take(&mut self.connectors);
            runtime.spawn(async move {
                let _ = release_in(&connectors).await;
            });
        }
    }
}
