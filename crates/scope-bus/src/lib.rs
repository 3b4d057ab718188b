//! # Scope Bus - Scoped Publish/Subscribe
//!
//! Participants exchange [`Event`](bus_types::Event)s addressed to
//! hierarchical scopes. A listener on `/a/` receives everything published on
//! `/a/`, `/a/b/`, `/a/b/c/` and so on, whichever transport carried it.
//!
//! ## Participants
//!
//! ```text
//!   Informer ──publish()──► OutRoute ──► connectors ──► transports
//!                                                         │
//!   Listener ◄──Handler── InRoute ◄── connectors ◄────────┘
//!   Reader   ◄──recv()─── (a listener with a queue)
//! ```
//!
//! Request/reply is layered on top: a [`LocalServer`] answers `REQUEST`
//! events on `<scope>/<method>/` and a [`RemoteServer`] turns each request
//! into an [`RpcFuture`] resolved by the matching `REPLY`.
//!
//! ## Example
//!
//! ```no_run
//! # async fn demo() -> Result<(), scope_bus::BusError> {
//! use scope_bus::{Bus, ParticipantConfig};
//! use bus_types::{Event, FilterChain, Scope};
//!
//! let bus = Bus::new(ParticipantConfig::default())?;
//! let scope = Scope::new("/sensors/")?;
//! bus.subscribe(&scope, FilterChain::new(), |event: Event| -> anyhow::Result<()> {
//!     println!("{}", event.scope);
//!     Ok(())
//! })
//! .await?;
//! bus.publish(&Scope::new("/sensors/temp/")?, 21.5f64).await?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod bus;
pub mod config;
pub mod error;
pub mod handler;
pub mod participant;
pub mod patterns;
pub mod pipeline;

pub use bus::Bus;
pub use config::{converters_for_transport, ParticipantConfig, TransportConfig};
pub use error::{BusError, ConfigError, FutureError};
pub use handler::{async_handler, AsyncHandler, Handler};
pub use participant::{Informer, Listener, Reader, Subscription};
pub use patterns::{
    method_scope, Callback, LocalServer, RemoteServer, RpcFuture, ERROR_KEY, REPLY_METHOD,
    REQUEST_METHOD,
};
pub use pipeline::HandlerErrorReport;

/// Handler error reports buffered per bus before slow receivers lag.
pub const DEFAULT_ERROR_CAPACITY: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;
    use bus_converter::default_converter_map;
    use bus_transport::TransportRegistry;
    use bus_types::{Event, FilterChain, Scope};
    use std::time::Duration;
    use tokio::sync::broadcast::error::RecvError;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_slow_error_receiver_lags() {
        let bus = Bus::with_parts(
            ParticipantConfig::default(),
            TransportRegistry::with_defaults(),
            default_converter_map().unwrap(),
            2,
        );
        let mut errors = bus.handler_errors();
        let (tx, mut invoked) = mpsc::unbounded_channel();
        let scope = Scope::new("/lag").unwrap();
        bus.subscribe(&scope, FilterChain::new(), move |_event: Event| -> anyhow::Result<()> {
            tx.send(())?;
            anyhow::bail!("always fails")
        })
        .await
        .unwrap();

        for i in 0..5i64 {
            bus.publish(&scope, i).await.unwrap();
        }
        // Reports of earlier events are sent before the next handler runs.
        for _ in 0..5 {
            timeout(Duration::from_secs(5), invoked.recv())
                .await
                .unwrap()
                .unwrap();
        }

        assert!(matches!(errors.recv().await, Err(RecvError::Lagged(_))));
        let report = timeout(Duration::from_secs(5), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.message, "always fails");
    }
}
