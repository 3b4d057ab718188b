//! Publishing participant.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bus_types::{DataType, Event, EventFilter, EventId, FilterAction, Payload, Scope};
use tokio::sync::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::BusError;
use crate::pipeline::OutRoute;

/// Publishes events on a scope and its sub-scopes.
///
/// Event ids are assigned under a lock that is held until every connector
/// has accepted the event, so events of one informer leave in id order even
/// when published from several tasks.
pub struct Informer {
    id: Uuid,
    scope: Scope,
    data_type: Option<DataType>,
    sequence: Mutex<u64>,
    route: Arc<OutRoute>,
    active: AtomicBool,
}

impl Informer {
    pub(crate) fn new(
        id: Uuid,
        scope: Scope,
        data_type: Option<DataType>,
        route: OutRoute,
    ) -> Self {
        Self {
            id,
            scope,
            data_type,
            sequence: Mutex::new(0),
            route: Arc::new(route),
            active: AtomicBool::new(true),
        }
    }

    /// Participant id carried in the ids of published events.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Accepted payload type; `None` accepts any.
    #[must_use]
    pub fn data_type(&self) -> Option<&DataType> {
        self.data_type.as_ref()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Publish `data` on the informer's scope.
    pub async fn publish<T: Any + Send + Sync>(&self, data: T) -> Result<Event, BusError> {
        self.publish_event(Event::new(self.scope.clone(), Payload::new(data)))
            .await
    }

    /// Publish a prepared event. Returns it with id and send time set.
    pub async fn publish_event(&self, event: Event) -> Result<Event, BusError> {
        self.publish_correlated(event, |_| {}).await
    }

    /// Publish `event`, calling `register` with its id before it is handed
    /// to any connector.
    pub(crate) async fn publish_correlated<F>(
        &self,
        mut event: Event,
        register: F,
    ) -> Result<Event, BusError>
    where
        F: FnOnce(EventId),
    {
        if !self.is_active() {
            return Err(BusError::Closed);
        }
        if !self.scope.contains(&event.scope) {
            return Err(BusError::ScopeMismatch {
                event: event.scope,
                participant: self.scope.clone(),
            });
        }
        if let Some(expected) = &self.data_type {
            if expected != event.data_type() {
                return Err(BusError::DataTypeMismatch {
                    expected: expected.clone(),
                    actual: event.data_type().clone(),
                });
            }
        }

        let mut sequence = self.sequence.lock().await;
        let id = EventId::new(self.id, *sequence);
        *sequence += 1;
        event.id = Some(id);
        register(id);
        self.route.publish(&mut event).await?;
        trace!(scope = %event.scope, event_id = %id, "Event published");
        Ok(event)
    }

    /// Add an outbound filter; events it rejects are silently not sent.
    pub fn add_filter(&self, filter: Arc<dyn EventFilter>) {
        self.route.apply_filter(filter, FilterAction::Add);
    }

    pub fn remove_filter(&self, filter: Arc<dyn EventFilter>) {
        self.route.apply_filter(filter, FilterAction::Remove);
    }

    /// Deactivate all connectors. Calling it again is a no-op.
    pub async fn deactivate(&self) -> Result<(), BusError> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(participant = %self.id, scope = %self.scope, "Deactivating informer");
        self.route.close().await
    }
}

impl fmt::Debug for Informer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Informer")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("data_type", &self.data_type)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for Informer {
    fn drop(&mut self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        // Release transport resources in the background when dropped
        // without deactivation.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let route = Arc::clone(&self.route);
            runtime.spawn(async move {
                let _ = route.close().await;
            });
        }
    }
}
