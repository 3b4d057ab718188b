//! # Event Processing Pipeline
//!
//! ```text
//!   Informer ──► OutRoute ──► OutConnector* ──► transport
//!   transport ──► InConnector* ──EventSink──► pump ──► InRoute ──► subscription tasks ──► Handler
//! ```
//!
//! The out route checks converters for every connector before sending, so a
//! conversion failure never leaves an event half published. The in route
//! keeps one queue and task per subscription: arrival order holds per
//! subscription, subscriptions run concurrently, and a failing handler is
//! reported without affecting anyone else.

mod in_route;
mod out_route;

use std::sync::Arc;

use bus_types::Event;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub use in_route::{HandlerErrorReport, InRoute};
pub use out_route::{OutBinding, OutRoute};

/// Forward everything received from in-connectors to `route`.
pub(crate) fn spawn_pump(
    mut events: mpsc::UnboundedReceiver<Event>,
    route: Arc<InRoute>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            route.dispatch(event);
        }
        debug!("Inbound pump stopped");
    })
}
