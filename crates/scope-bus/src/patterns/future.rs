//! # Reply Futures
//!
//! An [`RpcFuture`] stands for the reply to one request event. It starts
//! pending and reaches exactly one terminal state:
//!
//! ```text
//!              reply ──► Fulfilled
//!   Pending ── error reply / timeout ──► Failed
//!              cancel ──► Cancelled
//! ```
//!
//! The first transition wins; later replies, timeouts and cancels leave the
//! state untouched. Dropping a pending future cancels it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bus_telemetry::future_resolved;
use bus_types::{Event, EventId};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::server::ERROR_KEY;
use crate::error::FutureError;

#[derive(Debug, Clone)]
enum FutureState {
    Pending,
    Fulfilled(Event),
    Failed(FutureError),
    Cancelled,
}

impl FutureState {
    fn is_pending(&self) -> bool {
        matches!(self, FutureState::Pending)
    }

    fn result(&self) -> Option<Result<Event, FutureError>> {
        match self {
            FutureState::Pending => None,
            FutureState::Fulfilled(event) => Some(Ok(event.clone())),
            FutureState::Failed(error) => Some(Err(error.clone())),
            FutureState::Cancelled => Some(Err(FutureError::Cancelled)),
        }
    }
}

struct Slot {
    request_id: EventId,
    state: watch::Sender<FutureState>,
}

impl Slot {
    /// Move to `next` if still pending.
    fn complete(&self, next: FutureState, outcome: &str) -> bool {
        let completed = self.state.send_if_modified(|state| {
            if state.is_pending() {
                *state = next;
                true
            } else {
                false
            }
        });
        if completed {
            future_resolved(outcome);
            debug!(request_id = %self.request_id, outcome, "Future resolved");
        }
        completed
    }
}

/// Pending requests keyed by request id.
#[derive(Default)]
pub(crate) struct FutureTable {
    pending: Mutex<HashMap<EventId, Arc<Slot>>>,
}

impl FutureTable {
    pub(crate) fn register(self: &Arc<Self>, request_id: EventId, timeout: Duration) -> RpcFuture {
        let (state, _) = watch::channel(FutureState::Pending);
        let slot = Arc::new(Slot { request_id, state });
        self.pending.lock().insert(request_id, Arc::clone(&slot));
        RpcFuture {
            slot,
            table: Arc::downgrade(self),
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    fn forget(&self, request_id: &EventId) {
        self.pending.lock().remove(request_id);
    }

    /// Resolve the future `reply` answers, if any. Replies carrying the
    /// error marker fail it.
    pub(crate) fn resolve(&self, reply: &Event) -> bool {
        let slot = {
            let mut pending = self.pending.lock();
            reply.causes.iter().find_map(|cause| pending.remove(cause))
        };
        let Some(slot) = slot else {
            trace!(scope = %reply.scope, "Reply matches no pending request");
            return false;
        };

        match reply.meta_data.user_infos.get(ERROR_KEY) {
            Some(marker) => {
                let message = reply
                    .payload
                    .downcast_ref::<String>()
                    .cloned()
                    .unwrap_or_else(|| marker.clone());
                slot.complete(FutureState::Failed(FutureError::Remote(message)), "failed")
            }
            None => slot.complete(FutureState::Fulfilled(reply.clone()), "fulfilled"),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Handle to the reply of a request.
pub struct RpcFuture {
    slot: Arc<Slot>,
    table: Weak<FutureTable>,
    timeout: Duration,
    deadline: Instant,
}

impl RpcFuture {
    /// Id of the request event.
    #[must_use]
    pub fn request_id(&self) -> EventId {
        self.slot.request_id
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.slot.state.borrow().is_pending()
    }

    /// The outcome, if the future has left the pending state.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<Event, FutureError>> {
        self.slot.state.borrow().result()
    }

    /// Wait for the reply until the deadline set when the request was sent.
    ///
    /// On timeout the future fails with [`FutureError::Timeout`] and stays
    /// failed.
    pub async fn wait(&self) -> Result<Event, FutureError> {
        let mut state = self.slot.state.subscribe();
        let waited = tokio::time::timeout_at(self.deadline, state.wait_for(|s| !s.is_pending()))
            .await
            .is_ok();
        if !waited {
            self.finish(FutureState::Failed(FutureError::Timeout(self.timeout)), "timeout");
        }
        // Terminal by now, either resolved while waiting or failed above.
        self.try_result()
            .unwrap_or(Err(FutureError::Timeout(self.timeout)))
    }

    /// Give up on the reply. A late reply is dropped. Returns false if the
    /// future was already resolved.
    pub fn cancel(&self) -> bool {
        self.finish(FutureState::Cancelled, "cancelled")
    }

    fn finish(&self, state: FutureState, outcome: &str) -> bool {
        if let Some(table) = self.table.upgrade() {
            table.forget(&self.slot.request_id);
        }
        self.slot.complete(state, outcome)
    }
}

impl Drop for RpcFuture {
    /// A request nobody waits for anymore stops occupying the table.
    fn drop(&mut self) {
        if self.slot.state.borrow().is_pending() {
            self.finish(FutureState::Cancelled, "dropped");
        }
    }
}

impl fmt::Debug for RpcFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcFuture")
            .field("request_id", &self.slot.request_id)
            .field("state", &*self.slot.state.borrow())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_types::{Payload, Scope};
    use uuid::Uuid;

    fn reply_to(request: EventId, payload: Payload) -> Event {
        Event::new(Scope::new("/srv/m").unwrap(), payload).with_cause(request)
    }

    fn request_id(seq: u64) -> EventId {
        EventId::new(Uuid::nil(), seq)
    }

    #[tokio::test]
    async fn test_reply_fulfills_exactly_once() {
        let table = Arc::new(FutureTable::default());
        let future = table.register(request_id(1), Duration::from_secs(5));
        assert!(future.is_pending());

        assert!(table.resolve(&reply_to(request_id(1), Payload::new(1i64))));
        assert!(!table.resolve(&reply_to(request_id(1), Payload::new(2i64))));
        assert_eq!(table.len(), 0);

        let reply = future.wait().await.unwrap();
        assert_eq!(reply.payload.downcast_ref::<i64>(), Some(&1));
        assert!(!future.cancel());
    }

    #[tokio::test]
    async fn test_error_reply_fails() {
        let table = Arc::new(FutureTable::default());
        let future = table.register(request_id(2), Duration::from_secs(5));
        let reply = reply_to(request_id(2), Payload::new("division by zero".to_string()))
            .with_user_info(ERROR_KEY, "1");
        assert!(table.resolve(&reply));
        assert_eq!(
            future.wait().await.unwrap_err(),
            FutureError::Remote("division by zero".into())
        );
    }

    #[tokio::test]
    async fn test_timeout_is_terminal() {
        let table = Arc::new(FutureTable::default());
        let future = table.register(request_id(3), Duration::from_millis(20));

        assert_eq!(
            future.wait().await.unwrap_err(),
            FutureError::Timeout(Duration::from_millis(20))
        );
        assert!(!future.is_pending());
        assert_eq!(table.len(), 0);
        assert!(!table.resolve(&reply_to(request_id(3), Payload::empty())));
        assert!(matches!(
            future.try_result(),
            Some(Err(FutureError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn test_cancel_twice_is_noop() {
        let table = Arc::new(FutureTable::default());
        let future = table.register(request_id(4), Duration::from_secs(5));

        assert!(future.cancel());
        assert!(!future.cancel());
        assert_eq!(table.len(), 0);
        assert!(!table.resolve(&reply_to(request_id(4), Payload::empty())));
        assert_eq!(future.wait().await.unwrap_err(), FutureError::Cancelled);
    }

    #[tokio::test]
    async fn test_dropped_futures_leave_the_table() {
        let table = Arc::new(FutureTable::default());
        for seq in 0..1000 {
            drop(table.register(request_id(seq), Duration::from_millis(1)));
        }
        assert_eq!(table.len(), 0);

        let kept = table.register(request_id(1000), Duration::from_secs(5));
        let abandoned = table.register(request_id(1001), Duration::from_secs(5));
        drop(abandoned);
        assert_eq!(table.len(), 1);
        assert!(!table.resolve(&reply_to(request_id(1001), Payload::empty())));
        assert!(table.resolve(&reply_to(request_id(1000), Payload::empty())));
        assert!(kept.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_resolution() {
        let table = Arc::new(FutureTable::default());
        let future = table.register(request_id(5), Duration::from_secs(5));

        let resolver = Arc::clone(&table);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            resolver.resolve(&reply_to(request_id(5), Payload::new(true)));
        });
        let reply = future.wait().await.unwrap();
        assert_eq!(reply.payload.downcast_ref::<bool>(), Some(&true));
    }
}
