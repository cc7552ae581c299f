//! Shared utilities for acceptor integration tests.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use diameter_acceptor::codec::{BaseProtocolCodec, DiameterMessage, MessageBuilder};
use diameter_acceptor::net::{
    AcceptContext, Acceptor, Connection, ConnectionError, ConnectionId, Protocol,
};
use diameter_acceptor::peer::PeerManager;
use diameter_acceptor::Shutdown;

/// A complete CER from `host`.
pub fn cer(host: &str) -> Bytes {
    MessageBuilder::capabilities_exchange_request(host, "example.net", "127.0.0.1".parse().unwrap())
        .build()
}

/// A well-formed request that is not a CER.
pub fn dwr(host: &str) -> Bytes {
    MessageBuilder::device_watchdog_request(host, "example.net").build()
}

/// Peer manager that keeps every handed-off connection open and counts calls.
#[derive(Default)]
pub struct RecordingPeers {
    started: AtomicUsize,
    delay: Option<Duration>,
    handoffs: Mutex<Vec<(DiameterMessage, Box<dyn Connection>)>>,
}

impl RecordingPeers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hand-offs take `delay` before they are recorded.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    /// Calls to `handle_new_cer` that have begun.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Calls to `handle_new_cer` that have completed.
    pub fn count(&self) -> usize {
        self.handoffs.lock().len()
    }

    pub fn origin_hosts(&self) -> Vec<String> {
        self.handoffs
            .lock()
            .iter()
            .filter_map(|(message, _)| message.origin_host().map(str::to_string))
            .collect()
    }

    pub fn any_closed(&self) -> bool {
        self.handoffs.lock().iter().any(|(_, conn)| conn.is_closed())
    }
}

#[async_trait]
impl PeerManager for RecordingPeers {
    async fn handle_new_cer(&self, message: DiameterMessage, connection: Box<dyn Connection>) {
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.handoffs.lock().push((message, connection));
    }
}

/// Observable side of a [`FakeConnection`].
#[derive(Default)]
pub struct ConnectionProbe {
    pub closes: AtomicUsize,
    pub handshakes: AtomicUsize,
}

impl ConnectionProbe {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// In-memory connection fed through a channel. Receives pend until a frame
/// is sent or the sender is dropped.
pub struct FakeConnection {
    id: ConnectionId,
    description: String,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    probe: Arc<ConnectionProbe>,
    closed: bool,
}

/// Test-side handle of a fake connection.
pub struct FakePeer {
    pub frames: mpsc::UnboundedSender<Bytes>,
    pub probe: Arc<ConnectionProbe>,
}

pub fn fake_connection() -> (Box<dyn Connection>, FakePeer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let probe = Arc::new(ConnectionProbe::default());
    let id = ConnectionId::new();
    let conn = FakeConnection {
        id,
        description: format!("FAKE ({id})"),
        inbound: rx,
        probe: Arc::clone(&probe),
        closed: false,
    };
    (Box::new(conn), FakePeer { frames: tx, probe })
}

#[async_trait]
impl Connection for FakeConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn is_tls(&self) -> bool {
        false
    }

    async fn handshake(&mut self) -> Result<(), ConnectionError> {
        self.probe.handshakes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn receive(&mut self) -> Result<Bytes, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        self.inbound.recv().await.ok_or(ConnectionError::Closed)
    }

    async fn send(&mut self, _data: &[u8]) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Acceptor fed through a channel. Dropping the sender makes `accept` fail.
pub struct FakeAcceptor {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Box<dyn Connection>>>,
}

pub fn fake_acceptor() -> (Box<dyn Acceptor>, mpsc::UnboundedSender<Box<dyn Connection>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let acceptor = FakeAcceptor {
        incoming: tokio::sync::Mutex::new(rx),
    };
    (Box::new(acceptor), tx)
}

#[async_trait]
impl Acceptor for FakeAcceptor {
    async fn accept(&self) -> io::Result<Box<dyn Connection>> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "acceptor socket failed"))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok("127.0.0.1:3868".parse().unwrap())
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }
}

pub fn context(peers: Arc<RecordingPeers>, shutdown: &Shutdown, timeout: Duration) -> AcceptContext {
    AcceptContext::new(Arc::new(BaseProtocolCodec::default()), peers, shutdown.clone())
        .with_incoming_timeout(timeout)
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
