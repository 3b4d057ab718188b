//! # Integration Test Flows
//!
//! Buses wired together over real transports:
//!
//! - **inprocess**: participants of one bus share payloads without copies
//! - **socket**: two buses in one process, one serving and one connecting
//!   over TCP on the loopback interface
//! - **group**: two buses whose group factories share one
//!   [`InMemoryGroupHub`](bus_transport::InMemoryGroupHub)

pub mod pipeline;
pub mod pubsub;
pub mod rpc;

#[cfg(test)]
pub(crate) mod fixtures {
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::time::Duration;

    use bus_transport::{GroupFactory, InMemoryGroupHub};
    use bus_types::{Event, Scope};
    use scope_bus::{Bus, Handler, ParticipantConfig, TransportConfig};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    /// Time given to remote transports to settle connections.
    pub const SETTLE: Duration = Duration::from_millis(200);

    pub fn scope(s: &str) -> Scope {
        Scope::new(s).unwrap()
    }

    /// A loopback port nobody is listening on right now.
    pub fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Only the socket transport, on the loopback interface.
    pub fn socket_config(port: u16, server: &str) -> ParticipantConfig {
        ParticipantConfig::empty().with_transport(
            TransportConfig::new("socket")
                .enabled()
                .with_option("host", "127.0.0.1")
                .with_option("port", port.to_string())
                .with_option("server", server),
        )
    }

    pub fn group_config() -> ParticipantConfig {
        ParticipantConfig::empty().with_transport(TransportConfig::new("group").enabled())
    }

    /// A serving and a connecting bus on the same port.
    pub fn socket_pair() -> (Bus, Bus) {
        let port = free_port();
        let server = Bus::new(socket_config(port, "1")).unwrap();
        let client = Bus::new(socket_config(port, "0")).unwrap();
        (server, client)
    }

    /// Two buses using the group transport through one hub.
    pub fn group_pair() -> (Bus, Bus, Arc<InMemoryGroupHub>) {
        let hub = Arc::new(InMemoryGroupHub::new());
        let first = Bus::new(group_config()).unwrap();
        let second = Bus::new(group_config()).unwrap();
        for bus in [&first, &second] {
            bus.transports()
                .register(Arc::new(GroupFactory::new(hub.clone())))
                .unwrap();
        }
        (first, second, hub)
    }

    /// Handler forwarding every event to the returned receiver.
    pub fn collector() -> (impl Handler + 'static, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |event: Event| -> anyhow::Result<()> {
            tx.send(event)?;
            Ok(())
        };
        (handler, rx)
    }

    pub async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event within 5s")
            .expect("collector closed")
    }

    /// Assert nothing more arrives for a short while.
    pub async fn quiet(rx: &mut mpsc::UnboundedReceiver<Event>) {
        let extra = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(extra.is_err(), "unexpected event: {:?}", extra);
    }
}
