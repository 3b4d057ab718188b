//! Socket bus: TCP connections, framing and local dispatch.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bus_converter::ConverterSelection;
use bus_types::Event;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{ServerMode, SocketOptions};
use crate::error::TransportError;
use crate::notification::{encode_event, AssemblyPool, FragmentedNotification};
use crate::sinks::{ConvertingSink, SinkTable};

/// Largest frame accepted from a peer, and the fragment size used when
/// sending.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// How long closing a bus waits for queued frames to be written.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Incomplete events older than this are discarded.
const ASSEMBLY_MAX_AGE: Duration = Duration::from_secs(30);

type Frame = Arc<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusRole {
    Server,
    Client,
}

/// State shared between a bus and its connection tasks.
#[derive(Debug)]
struct Shared {
    role: BusRole,
    sinks: SinkTable,
    peers: Mutex<HashMap<u64, mpsc::UnboundedSender<Frame>>>,
    pool: Mutex<AssemblyPool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_peer: AtomicU64,
    shutdown: watch::Sender<bool>,
    /// Why a client lost its server connection. Set once, never cleared.
    lost: Mutex<Option<String>>,
}

/// One TCP bus endpoint, either the server or a client.
#[derive(Debug)]
pub struct SocketBus {
    host: String,
    port: u16,
    role: BusRole,
    shared: Arc<Shared>,
}

impl SocketBus {
    pub(crate) async fn open(options: &SocketOptions) -> Result<Arc<Self>, TransportError> {
        match options.server {
            ServerMode::Server => Self::serve(options).await,
            ServerMode::Client => Self::connect(options).await,
            ServerMode::Auto => match Self::serve(options).await {
                Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!(
                        host = %options.host,
                        port = options.port,
                        "Port taken, connecting as client"
                    );
                    Self::connect(options).await
                }
                other => other,
            },
        }
    }

    fn with_role(host: &str, port: u16, role: BusRole) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            host: host.to_string(),
            port,
            role,
            shared: Arc::new(Shared {
                role,
                sinks: SinkTable::default(),
                peers: Mutex::new(HashMap::new()),
                pool: Mutex::new(AssemblyPool::new()),
                tasks: Mutex::new(Vec::new()),
                next_peer: AtomicU64::new(1),
                shutdown,
                lost: Mutex::new(None),
            }),
        }
    }

    async fn serve(options: &SocketOptions) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind((options.host.as_str(), options.port)).await?;
        let port = listener.local_addr()?.port();
        let bus = Self::with_role(&options.host, port, BusRole::Server);

        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&bus.shared),
            bus.shared.shutdown.subscribe(),
            options.nodelay,
        ));
        bus.shared.track(accept);

        info!(host = %options.host, port, "Socket bus server listening");
        Ok(Arc::new(bus))
    }

    async fn connect(options: &SocketOptions) -> Result<Arc<Self>, TransportError> {
        if options.port == 0 {
            return Err(TransportError::InvalidOption {
                key: "port".to_string(),
                value: "0".to_string(),
                reason: "clients need the port of a running server".to_string(),
            });
        }
        let stream = TcpStream::connect((options.host.as_str(), options.port)).await?;
        let bus = Self::with_role(&options.host, options.port, BusRole::Client);
        bus.shared.attach(stream, options.nodelay)?;

        info!(host = %options.host, port = options.port, "Connected to socket bus server");
        Ok(Arc::new(bus))
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Bound port for servers, server port for clients.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn role(&self) -> BusRole {
        self.role
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("socket://{}:{}", self.host, self.port)
    }

    /// Number of open TCP connections.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.shared.peers.lock().len()
    }

    /// False once the bus is closed or a client lost its server.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !*self.shared.shutdown.borrow() && self.shared.lost.lock().is_none()
    }

    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.shared.sinks.len()
    }

    pub(crate) fn add_sink(&self, id: u64, sink: ConvertingSink) {
        self.shared.sinks.insert(id, sink);
    }

    pub(crate) fn remove_sink(&self, id: u64) {
        self.shared.sinks.remove(id);
    }

    /// Encode `event`, send it to all peers and deliver it to local sinks.
    pub(crate) fn publish(
        &self,
        event: &Event,
        converters: &dyn ConverterSelection,
    ) -> Result<(), TransportError> {
        if *self.shared.shutdown.borrow() {
            return Err(TransportError::Closed);
        }
        self.shared.ensure_connected()?;
        let fragments = encode_event(event, converters, MAX_FRAME_SIZE)?;
        for fragment in fragments {
            let frame = Arc::new(frame(&fragment.to_bytes()?)?);
            self.shared.broadcast(&frame, None);
            self.shared.ingest(fragment);
        }
        trace!(scope = %event.scope, url = %self.url(), "Published event on socket bus");
        Ok(())
    }

    /// Stop all connection tasks, waiting a bounded time for queued frames.
    pub(crate) async fn close(&self) {
        self.shared.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.shared.peers.lock().clear();
        info!(url = %self.url(), "Socket bus closed");
    }
}

impl Drop for SocketBus {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl Shared {
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Register a connection and start its reader and writer.
    fn attach(self: &Arc<Self>, stream: TcpStream, nodelay: bool) -> Result<u64, TransportError> {
        stream.set_nodelay(nodelay)?;
        let peer = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().insert(peer, tx);

        let write = tokio::spawn(write_loop(
            Arc::clone(self),
            peer,
            writer,
            rx,
            self.shutdown.subscribe(),
        ));
        let read = tokio::spawn(read_loop(
            Arc::clone(self),
            peer,
            reader,
            self.shutdown.subscribe(),
        ));
        self.track(write);
        self.track(read);
        Ok(peer)
    }

    fn broadcast(&self, frame: &Frame, except: Option<u64>) {
        for (peer, tx) in self.peers.lock().iter() {
            if Some(*peer) != except {
                // A closed channel means the peer is being removed.
                let _ = tx.send(Arc::clone(frame));
            }
        }
    }

    fn on_frame(&self, from: u64, bytes: Vec<u8>) {
        let fragment = match FragmentedNotification::from_bytes(&bytes) {
            Ok(fragment) => fragment,
            Err(e) => {
                warn!(peer = from, error = %e, "Dropping undecodable frame");
                bus_telemetry::frame_dropped("decode");
                return;
            }
        };
        if self.role == BusRole::Server {
            match frame(&bytes) {
                Ok(framed) => self.broadcast(&Arc::new(framed), Some(from)),
                Err(e) => warn!(peer = from, error = %e, "Cannot relay frame"),
            }
        }
        self.ingest(fragment);
    }

    fn ingest(&self, fragment: FragmentedNotification) {
        let complete = {
            let mut pool = self.pool.lock();
            let result = pool.add(fragment);
            if !pool.is_empty() {
                let discarded = pool.prune(ASSEMBLY_MAX_AGE);
                if discarded > 0 {
                    warn!(discarded, "Discarded incomplete events");
                }
            }
            result
        };
        match complete {
            Ok(Some(notification)) => {
                self.sinks.deliver(&notification);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Dropping fragment");
                bus_telemetry::frame_dropped("assembly");
            }
        }
    }

    /// Forget `peer`. A client whose connection failed or was closed by the
    /// server cannot publish anymore.
    fn remove_peer(&self, peer: u64, failure: Option<String>) {
        self.peers.lock().remove(&peer);
        if let (BusRole::Client, Some(reason)) = (self.role, failure) {
            let mut lost = self.lost.lock();
            if lost.is_none() {
                warn!(peer, reason = %reason, "Lost connection to socket bus server");
                *lost = Some(reason);
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.role == BusRole::Server {
            return Ok(());
        }
        let reason = match self.lost.lock().as_ref() {
            Some(reason) => reason.clone(),
            None if self.peers.lock().is_empty() => "no server connection".to_string(),
            None => return Ok(()),
        };
        Err(TransportError::Io(io::Error::new(
            io::ErrorKind::NotConnected,
            reason,
        )))
    }
}

/// Prefix `payload` with its little-endian length.
pub(crate) fn frame(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let size = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Read one frame. Returns `None` on a clean end of stream between frames.
///
/// Oversized frames are skipped and reported as
/// [`TransportError::FrameTooLarge`]; the stream stays usable.
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    max: usize,
) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let size = u32::from_le_bytes(len) as usize;
    if size > max {
        let mut skipped = (&mut *reader).take(size as u64);
        tokio::io::copy(&mut skipped, &mut tokio::io::sink()).await?;
        return Err(TransportError::FrameTooLarge { size, max });
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    nodelay: bool,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    match shared.attach(stream, nodelay) {
                        Ok(peer) => debug!(peer, %addr, "Accepted socket bus client"),
                        Err(e) => warn!(%addr, error = %e, "Failed to set up client connection"),
                    }
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }
    debug!("Socket bus accept loop stopped");
}

async fn read_loop(
    shared: Arc<Shared>,
    peer: u64,
    mut reader: OwnedReadHalf,
    mut shutdown: watch::Receiver<bool>,
) {
    let failure = loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break None,
            frame = read_frame(&mut reader, MAX_FRAME_SIZE) => frame,
        };
        match frame {
            Ok(Some(bytes)) => shared.on_frame(peer, bytes),
            Ok(None) => {
                debug!(peer, "Peer closed connection");
                break Some("connection closed by peer".to_string());
            }
            Err(TransportError::FrameTooLarge { size, max }) => {
                warn!(peer, size, max, "Dropping oversized frame");
                bus_telemetry::frame_dropped("oversized");
            }
            Err(e) => {
                warn!(peer, error = %e, "Connection failed");
                break Some(e.to_string());
            }
        }
    };
    shared.remove_peer(peer, failure);
}

async fn write_loop(
    shared: Arc<Shared>,
    peer: u64,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        debug!(peer, error = %e, "Write failed");
                        shared.remove_peer(peer, Some(e.to_string()));
                        return;
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => {
                while let Ok(frame) = frames.try_recv() {
                    if writer.write_all(&frame).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&frame(b"hello").unwrap()).await.unwrap();
        client.write_all(&frame(b"").unwrap()).await.unwrap();
        drop(client);

        assert_eq!(
            read_frame(&mut server, 64).await.unwrap().as_deref(),
            Some(&b"hello"[..])
        );
        assert_eq!(read_frame(&mut server, 64).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut server, 64).await.unwrap(), None);
    }

    #[test]
    fn test_length_prefix_is_little_endian() {
        let framed = frame(&[7u8; 258]).unwrap();
        assert_eq!(&framed[..4], &[2, 1, 0, 0]);
        assert_eq!(framed.len(), 262);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_skipped() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&frame(&[1u8; 100]).unwrap()).await.unwrap();
        client.write_all(&frame(b"next").unwrap()).await.unwrap();
        drop(client);

        assert!(matches!(
            read_frame(&mut server, 50).await,
            Err(TransportError::FrameTooLarge { size: 100, max: 50 })
        ));
        assert_eq!(
            read_frame(&mut server, 50).await.unwrap().as_deref(),
            Some(&b"next"[..])
        );
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[10, 0, 0, 0, 1, 2]).await.unwrap();
        drop(client);
        assert!(matches!(
            read_frame(&mut server, 64).await,
            Err(TransportError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let options = SocketOptions {
            host: "127.0.0.1".to_string(),
            port: 0,
            server: ServerMode::Server,
            nodelay: true,
        };
        let bus = SocketBus::open(&options).await.unwrap();
        assert_ne!(bus.port(), 0);
        bus.close().await;

        let converters = bus_converter::default_converter_map().unwrap();
        let mut event = Event::new(bus_types::Scope::root(), bus_types::Payload::empty());
        event.id = Some(bus_types::EventId::new(uuid::Uuid::nil(), 0));
        assert!(matches!(
            bus.publish(&event, &converters),
            Err(TransportError::Closed)
        ));
    }
}
