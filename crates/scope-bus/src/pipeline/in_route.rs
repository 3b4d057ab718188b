//! Inbound dispatch: from connectors to subscription handlers.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bus_telemetry::{
    metric_inc, HistogramTimer, EVENTS_DELIVERED, HANDLER_DURATION, HANDLER_ERRORS,
};
use bus_types::{Event, EventFilter, EventId, FilterAction, FilterChain, Scope};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::handler::Handler;

/// A failed handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerErrorReport {
    /// Scope of the event being handled.
    pub scope: Scope,
    pub subscription_id: u64,
    pub event_id: Option<EventId>,
    pub message: String,
    /// Whether the handler panicked rather than returning an error.
    pub panicked: bool,
}

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

struct Slot {
    id: u64,
    filters: FilterChain,
    queue: mpsc::UnboundedSender<Event>,
    closed: Arc<AtomicBool>,
}

/// Matches received events against listener-wide filters and the filter
/// chain of every subscription, then queues them for the subscription's
/// dispatch task.
///
/// Each subscription has its own task, so one slow or failing handler
/// never holds up another, and a subscription sees events in the order the
/// route received them.
pub struct InRoute {
    filters: RwLock<FilterChain>,
    slots: RwLock<Vec<Arc<Slot>>>,
    errors: broadcast::Sender<HandlerErrorReport>,
}

impl InRoute {
    #[must_use]
    pub fn new(errors: broadcast::Sender<HandlerErrorReport>) -> Self {
        Self {
            filters: RwLock::new(FilterChain::new()),
            slots: RwLock::new(Vec::new()),
            errors,
        }
    }

    /// Add or remove a filter applied before any subscription.
    pub fn apply_filter(&self, filter: Arc<dyn EventFilter>, action: FilterAction) {
        self.filters.write().apply(filter, action);
    }

    /// Start dispatching matching events to `handler`. Returns the
    /// subscription id.
    ///
    /// Must be called within a tokio runtime.
    pub fn subscribe(&self, filters: FilterChain, handler: Arc<dyn Handler>) -> u64 {
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let (queue, events) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_subscription(
            id,
            handler,
            events,
            Arc::clone(&closed),
            self.errors.clone(),
        ));
        self.slots.write().push(Arc::new(Slot {
            id,
            filters,
            queue,
            closed,
        }));
        debug!(subscription_id = id, "Subscription added");
        id
    }

    /// Stop dispatching to subscription `id`. An invocation in progress
    /// finishes; queued events are discarded. Returns false if the
    /// subscription was already gone.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = {
            let mut slots = self.slots.write();
            slots
                .iter()
                .position(|slot| slot.id == id)
                .map(|pos| slots.remove(pos))
        };
        match removed {
            Some(slot) => {
                slot.closed.store(true, Ordering::Release);
                debug!(subscription_id = id, "Subscription removed");
                true
            }
            None => false,
        }
    }

    /// Remove every subscription.
    pub fn close(&self) {
        let slots = std::mem::take(&mut *self.slots.write());
        for slot in slots {
            slot.closed.store(true, Ordering::Release);
        }
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Queue `event` for every matching subscription. Returns the number of
    /// subscriptions it was queued for.
    pub fn dispatch(&self, mut event: Event) -> usize {
        if !self.filters.read().matches(&event) {
            trace!(scope = %event.scope, "Event rejected by listener filters");
            return 0;
        }
        event.meta_data.set_deliver_time();

        let slots = self.slots.read().clone();
        let mut queued = 0;
        for slot in slots.iter().filter(|slot| slot.filters.matches(&event)) {
            if slot.queue.send(event.clone()).is_ok() {
                queued += 1;
            }
        }
        trace!(scope = %event.scope, queued, "Event dispatched");
        queued
    }
}

impl Drop for InRoute {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_subscription(
    id: u64,
    handler: Arc<dyn Handler>,
    mut events: mpsc::UnboundedReceiver<Event>,
    closed: Arc<AtomicBool>,
    errors: broadcast::Sender<HandlerErrorReport>,
) {
    while let Some(event) = events.recv().await {
        if closed.load(Ordering::Acquire) {
            break;
        }
        metric_inc!(EVENTS_DELIVERED);
        let scope = event.scope.clone();
        let event_id = event.id;

        let invocation = {
            let _timer = HistogramTimer::new(&HANDLER_DURATION);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.handle(event).await }).await
        };

        let (message, panicked) = match invocation {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => (format!("{e:#}"), false),
            Err(e) if e.is_panic() => (panic_message(e.into_panic()), true),
            Err(_) => {
                debug!(subscription_id = id, "Handler task cancelled");
                break;
            }
        };

        metric_inc!(HANDLER_ERRORS);
        warn!(
            subscription_id = id,
            scope = %scope,
            event_id = ?event_id,
            panicked,
            error = %message,
            "Handler failed"
        );
        // Nobody listening for reports is fine.
        let _ = errors.send(HandlerErrorReport {
            scope,
            subscription_id: id,
            event_id,
            message,
            panicked,
        });
    }
    debug!(subscription_id = id, "Subscription task stopped");
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
