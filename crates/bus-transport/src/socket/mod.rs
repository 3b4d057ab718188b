//! # Socket Transport
//!
//! Participants of several processes share a bus over TCP. One process runs
//! the bus server, all others connect to it as clients:
//!
//! ```text
//!   client A ──┐                 ┌── local sinks
//!              ├── bus server ───┤
//!   client B ──┘   (relays)      └── other clients
//! ```
//!
//! ## Options
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | `host` | `localhost` | Address the server binds to / clients connect to |
//! | `port` | `55555` | TCP port; `0` lets a server pick one |
//! | `server` | `auto` | `1` serve, `0` connect, `auto` serve if the port is free |
//! | `tcpnodelay` | `1` | Disable Nagle's algorithm on connections |
//!
//! Frames are a 4 byte little-endian length followed by one encoded
//! [`FragmentedNotification`](crate::notification::FragmentedNotification).
//! Connectors of one factory share a bus per `(host, port)`; the bus is
//! closed when the last connector using it deactivates.

mod bus;
mod connector;

use std::collections::HashMap;
use std::sync::Arc;

use bus_converter::{ConverterSelection, WireType};
use tokio::sync::Mutex;
use tracing::debug;

use crate::connector::{InConnector, OutConnector};
use crate::error::TransportError;
use crate::factory::{parse_bool, parse_option, TransportFactory, TransportOptions};

pub use bus::{BusRole, SocketBus, MAX_FRAME_SIZE};
pub use connector::{SocketInConnector, SocketOutConnector};

pub const TRANSPORT_NAME: &str = "socket";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 55555;

/// Which side of the bus a process takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerMode {
    /// Serve if the port can be bound, otherwise connect.
    #[default]
    Auto,
    Server,
    Client,
}

impl std::str::FromStr for ServerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(ServerMode::Auto);
        }
        match parse_bool(s) {
            Some(true) => Ok(ServerMode::Server),
            Some(false) => Ok(ServerMode::Client),
            None => Err("expected 'auto', '1' or '0'".to_string()),
        }
    }
}

/// Parsed socket transport options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    pub host: String,
    pub port: u16,
    pub server: ServerMode,
    pub nodelay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            server: ServerMode::Auto,
            nodelay: true,
        }
    }
}

impl SocketOptions {
    pub fn from_options(options: &TransportOptions) -> Result<Self, TransportError> {
        let defaults = Self::default();
        let nodelay = match options.get("tcpnodelay") {
            None => defaults.nodelay,
            Some(value) => parse_bool(value).ok_or_else(|| TransportError::InvalidOption {
                key: "tcpnodelay".to_string(),
                value: value.clone(),
                reason: "expected a boolean".to_string(),
            })?,
        };
        Ok(Self {
            host: options.get("host").cloned().unwrap_or(defaults.host),
            port: parse_option(options, "port", defaults.port)?,
            server: parse_option(options, "server", defaults.server)?,
            nodelay,
        })
    }
}

#[derive(Debug)]
struct BusEntry {
    bus: Arc<SocketBus>,
    users: usize,
}

/// Reference counted buses of one factory, keyed by `(host, port)`.
#[derive(Debug, Default)]
pub(crate) struct BusRegistry {
    buses: Mutex<HashMap<(String, u16), BusEntry>>,
}

impl BusRegistry {
    /// Return the bus for `options`, opening it if necessary. A bus that
    /// lost its server is replaced by a fresh connection.
    pub(crate) async fn acquire(
        &self,
        options: &SocketOptions,
    ) -> Result<Arc<SocketBus>, TransportError> {
        let mut buses = self.buses.lock().await;
        if options.port != 0 {
            let key = (options.host.clone(), options.port);
            if let Some(entry) = buses.get_mut(&key) {
                if entry.bus.is_alive() {
                    entry.users += 1;
                    return Ok(Arc::clone(&entry.bus));
                }
            }
            if let Some(dead) = buses.remove(&key) {
                debug!(url = %dead.bus.url(), "Reopening dead socket bus");
                dead.bus.close().await;
            }
        }

        let bus = SocketBus::open(options).await?;
        buses.insert(
            (options.host.clone(), bus.port()),
            BusEntry {
                bus: Arc::clone(&bus),
                users: 1,
            },
        );
        Ok(bus)
    }

    /// Drop one use of `bus`; closes it when it was the last.
    pub(crate) async fn release(&self, bus: &Arc<SocketBus>) {
        let key = (bus.host().to_string(), bus.port());
        let closing = {
            let mut buses = self.buses.lock().await;
            match buses.get_mut(&key) {
                Some(entry) if Arc::ptr_eq(&entry.bus, bus) => {
                    entry.users -= 1;
                    if entry.users == 0 {
                        buses.remove(&key).map(|entry| entry.bus)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(bus) = closing {
            debug!(url = %bus.url(), "Last connector left socket bus");
            bus.close().await;
        }
    }

    pub(crate) async fn len(&self) -> usize {
        self.buses.lock().await.len()
    }
}

/// Factory for the `socket` transport.
#[derive(Debug, Default)]
pub struct SocketFactory {
    registry: Arc<BusRegistry>,
}

impl SocketFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open buses.
    pub async fn bus_count(&self) -> usize {
        self.registry.len().await
    }
}

impl TransportFactory for SocketFactory {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn wire_type(&self) -> WireType {
        WireType::Bytes
    }

    fn create_in_connector(
        &self,
        converters: Arc<dyn ConverterSelection>,
        options: &TransportOptions,
    ) -> Result<Arc<dyn InConnector>, TransportError> {
        Ok(Arc::new(SocketInConnector::new(
            Arc::clone(&self.registry),
            SocketOptions::from_options(options)?,
            converters,
        )?))
    }

    fn create_out_connector(
        &self,
        converters: Arc<dyn ConverterSelection>,
        options: &TransportOptions,
    ) -> Result<Arc<dyn OutConnector>, TransportError> {
        Ok(Arc::new(SocketOutConnector::new(
            Arc::clone(&self.registry),
            SocketOptions::from_options(options)?,
            converters,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Connector;
    use bus_converter::default_converter_map;
    use bus_types::{Event, EventId, Payload, Scope};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn options(pairs: &[(&str, &str)]) -> TransportOptions {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn converters() -> Arc<dyn ConverterSelection> {
        Arc::new(default_converter_map().unwrap())
    }

    fn scope(s: &str) -> Scope {
        Scope::new(s).unwrap()
    }

    fn string_event(on: &str, seq: u64, text: &str) -> Event {
        let mut event = Event::new(scope(on), Payload::new(text.to_string()));
        event.id = Some(EventId::new(Uuid::new_v4(), seq));
        event
    }

    async fn wait_for_peers(bus: &SocketBus, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.peer_count() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_parse_options() {
        let parsed = SocketOptions::from_options(&TransportOptions::new()).unwrap();
        assert_eq!(parsed, SocketOptions::default());

        let parsed = SocketOptions::from_options(&options(&[
            ("host", "127.0.0.1"),
            ("port", "4444"),
            ("server", "0"),
            ("tcpnodelay", "false"),
        ]))
        .unwrap();
        assert_eq!(parsed.host, "127.0.0.1");
        assert_eq!(parsed.port, 4444);
        assert_eq!(parsed.server, ServerMode::Client);
        assert!(!parsed.nodelay);

        assert!(matches!(
            SocketOptions::from_options(&options(&[("server", "sometimes")])),
            Err(TransportError::InvalidOption { .. })
        ));
    }

    #[tokio::test]
    async fn test_connectors_of_one_factory_share_a_bus() {
        let factory = SocketFactory::new();
        let opts = options(&[("host", "127.0.0.1"), ("port", "0"), ("server", "1")]);

        let input = factory.create_in_connector(converters(), &opts).unwrap();
        input.set_scope(scope("/shared")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        input.set_observer(Some(tx));
        input.activate().await.unwrap();
        assert_eq!(factory.bus_count().await, 1);

        let port = input
            .transport_url()
            .rsplit(':')
            .next()
            .unwrap()
            .parse::<u16>()
            .unwrap();
        let opts = options(&[("host", "127.0.0.1"), ("port", &port.to_string())]);
        let output = factory.create_out_connector(converters(), &opts).unwrap();
        output.set_scope(scope("/shared")).unwrap();
        output.activate().await.unwrap();
        assert_eq!(factory.bus_count().await, 1);

        output
            .handle(&string_event("/shared", 1, "local"))
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload.downcast_ref::<String>().unwrap(), "local");

        output.deactivate().await.unwrap();
        assert_eq!(factory.bus_count().await, 1);
        input.deactivate().await.unwrap();
        assert_eq!(factory.bus_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_relays_between_processes() {
        // Separate factories behave like separate processes.
        let server_factory = SocketFactory::new();
        let server_opts = options(&[("host", "127.0.0.1"), ("port", "0"), ("server", "1")]);
        let server_in = server_factory
            .create_in_connector(converters(), &server_opts)
            .unwrap();
        server_in.set_scope(scope("/")).unwrap();
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        server_in.set_observer(Some(server_tx));
        server_in.activate().await.unwrap();
        let port = server_in.transport_url().rsplit(':').next().unwrap().to_string();

        let sender_factory = SocketFactory::new();
        let receiver_factory = SocketFactory::new();
        let client_opts = options(&[("host", "127.0.0.1"), ("port", &port), ("server", "auto")]);

        let receiver = receiver_factory
            .create_in_connector(converters(), &client_opts)
            .unwrap();
        receiver.set_scope(scope("/topic")).unwrap();
        let (rx_tx, mut rx_rx) = mpsc::unbounded_channel();
        receiver.set_observer(Some(rx_tx));
        receiver.activate().await.unwrap();

        let sender = sender_factory
            .create_out_connector(converters(), &client_opts)
            .unwrap();
        sender.set_scope(scope("/topic")).unwrap();
        sender.activate().await.unwrap();

        {
            let registry = server_factory.registry.buses.lock().await;
            let bus = &registry.values().next().unwrap().bus;
            assert_eq!(bus.role(), BusRole::Server);
            wait_for_peers(bus, 2).await;
        }

        for seq in 0..20 {
            sender
                .handle(&string_event("/topic/sub", seq, &format!("n{seq}")))
                .await
                .unwrap();
        }

        for seq in 0..20 {
            let relayed = tokio::time::timeout(Duration::from_secs(5), rx_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(relayed.sequence_number(), Some(seq));
            assert_eq!(
                relayed.payload.downcast_ref::<String>().unwrap(),
                &format!("n{seq}")
            );
            let local = tokio::time::timeout(Duration::from_secs(5), server_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(local.sequence_number(), Some(seq));
        }

        sender.deactivate().await.unwrap();
        receiver.deactivate().await.unwrap();
        server_in.deactivate().await.unwrap();
    }

    async fn wait_until_dead(bus: &SocketBus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.is_alive() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    fn server_options(port: u16) -> SocketOptions {
        SocketOptions {
            host: "127.0.0.1".to_string(),
            port,
            server: ServerMode::Server,
            nodelay: true,
        }
    }

    #[tokio::test]
    async fn test_client_publish_fails_after_server_is_gone() {
        let server = SocketBus::open(&server_options(0)).await.unwrap();
        let client_options = SocketOptions {
            server: ServerMode::Client,
            ..server_options(server.port())
        };
        let client = SocketBus::open(&client_options).await.unwrap();
        assert_eq!(client.peer_count(), 1);
        let converters = default_converter_map().unwrap();
        client
            .publish(&string_event("/a", 0, "before"), &converters)
            .unwrap();

        server.close().await;
        wait_until_dead(&client).await;

        assert_eq!(client.peer_count(), 0);
        assert!(matches!(
            client.publish(&string_event("/a", 1, "after"), &converters),
            Err(TransportError::Io(e)) if e.kind() == std::io::ErrorKind::NotConnected
        ));
    }

    #[tokio::test]
    async fn test_registry_reconnects_after_server_restart() {
        let first_server = SocketBus::open(&server_options(0)).await.unwrap();
        let port = first_server.port();
        let client_options = SocketOptions {
            server: ServerMode::Client,
            ..server_options(port)
        };
        let registry = BusRegistry::default();
        let stale = registry.acquire(&client_options).await.unwrap();

        first_server.close().await;
        wait_until_dead(&stale).await;
        let second_server = SocketBus::open(&server_options(port)).await.unwrap();

        let fresh = registry.acquire(&client_options).await.unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert!(fresh.is_alive());
        assert_eq!(registry.len().await, 1);
        let converters = default_converter_map().unwrap();
        fresh
            .publish(&string_event("/a", 0, "again"), &converters)
            .unwrap();

        // Releasing the replaced bus does not touch the new entry.
        registry.release(&stale).await;
        assert_eq!(registry.len().await, 1);
        registry.release(&fresh).await;
        assert_eq!(registry.len().await, 0);
        second_server.close().await;
    }

    #[tokio::test]
    async fn test_client_without_server_fails_to_activate() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let factory = SocketFactory::new();
        let opts = options(&[("host", "127.0.0.1"), ("port", &port.to_string()), ("server", "0")]);
        let input = factory.create_in_connector(converters(), &opts).unwrap();
        input.set_scope(scope("/a")).unwrap();
        assert!(matches!(input.activate().await, Err(TransportError::Io(_))));
        assert!(!input.is_active());
        assert_eq!(factory.bus_count().await, 0);
        input.deactivate().await.unwrap();
    }
}
