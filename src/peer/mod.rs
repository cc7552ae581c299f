//! Peer layer entry point.
//!
//! # Data Flow
//! ```text
//! PendingHandshake (validated CER + connection)
//!     → PeerManager::handle_new_cer (ownership moves here)
//!     → QueuedPeerManager pushes PeerEvent::IncomingCer
//!     → EventQueue<PeerEvent> → consumer task
//! ```
//!
//! # Design Decisions
//! - The acceptor only knows the `PeerManager` trait; the queue behind it is
//!   an implementation detail of this module
//! - Backlog is reported through watermarks, not by blocking the acceptor

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::DiameterMessage;
use crate::net::connection::Connection;
use crate::observability::metrics;
use crate::queue::{EventQueue, WatermarkHandler};

/// Receiver of connections whose first message was a valid CER.
#[async_trait]
pub trait PeerManager: Send + Sync {
    /// Take ownership of `message` and `connection`. The caller never touches
    /// either again.
    async fn handle_new_cer(&self, message: DiameterMessage, connection: Box<dyn Connection>);
}

/// Events flowing from the acceptor to the peer layer.
pub enum PeerEvent {
    IncomingCer {
        message: DiameterMessage,
        connection: Box<dyn Connection>,
    },
}

impl PeerEvent {
    /// Release any resources the event owns.
    pub async fn discard(self) {
        match self {
            PeerEvent::IncomingCer { mut connection, .. } => connection.close().await,
        }
    }
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::IncomingCer { message, connection } => f
                .debug_struct("IncomingCer")
                .field("origin_host", &message.origin_host())
                .field("connection", &connection.description())
                .finish(),
        }
    }
}

/// Forwards hand-offs into an event queue.
pub struct QueuedPeerManager {
    events: EventQueue<PeerEvent>,
}

impl QueuedPeerManager {
    pub fn new(events: EventQueue<PeerEvent>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &EventQueue<PeerEvent> {
        &self.events
    }
}

#[async_trait]
impl PeerManager for QueuedPeerManager {
    async fn handle_new_cer(&self, message: DiameterMessage, connection: Box<dyn Connection>) {
        let id = connection.id();
        if let Err(rejected) = self
            .events
            .push(PeerEvent::IncomingCer { message, connection })
            .await
        {
            tracing::warn!(
                connection = %id,
                error = %rejected,
                "Peer event queue unavailable, dropping connection"
            );
            rejected.into_inner().discard().await;
        }
    }
}

/// Watermark handler that reports queue backlog.
pub struct BacklogAlarm {
    queue: String,
}

impl BacklogAlarm {
    pub fn new(queue: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            queue: queue.into(),
        })
    }
}

impl<T> WatermarkHandler<T> for BacklogAlarm {
    fn on_high(&self, queue: &EventQueue<T>) {
        let depth = queue.len();
        tracing::warn!(queue = %self.queue, depth, "Event queue backlog growing");
        metrics::record_watermark(&self.queue, "high", depth);
    }

    fn on_low(&self, queue: &EventQueue<T>) {
        let depth = queue.len();
        tracing::info!(queue = %self.queue, depth, "Event queue backlog receding");
        metrics::record_watermark(&self.queue, "low", depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BaseProtocolCodec, MessageBuilder, MessageCodec};
    use crate::net::connection::{ConnectionError, ConnectionId, Protocol};
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Stub {
        id: ConnectionId,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connection for Stub {
        fn id(&self) -> ConnectionId {
            self.id
        }
        fn description(&self) -> &str {
            "stub"
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
            Ok(())
        }
        async fn receive(&mut self) -> Result<Bytes, ConnectionError> {
            Err(ConnectionError::Closed)
        }
        async fn send(&mut self, _data: &[u8]) -> Result<(), ConnectionError> {
            Ok(())
        }
        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn cer() -> DiameterMessage {
        let raw = MessageBuilder::capabilities_exchange_request(
            "peer.example",
            "example",
            "127.0.0.1".parse().unwrap(),
        )
        .build();
        BaseProtocolCodec::default().parse(raw).unwrap()
    }

    fn stub() -> (Box<dyn Connection>, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let conn = Stub {
            id: ConnectionId::new(),
            closed: Arc::clone(&closed),
        };
        (Box::new(conn), closed)
    }

    #[tokio::test]
    async fn hand_off_is_queued() {
        let events = EventQueue::unbounded();
        let peers = QueuedPeerManager::new(events.clone());
        let (conn, closed) = stub();

        peers.handle_new_cer(cer(), conn).await;

        let PeerEvent::IncomingCer { message, connection } = events.try_pop().unwrap();
        assert_eq!(message.origin_host(), Some("peer.example"));
        assert!(!connection.is_closed());
        assert!(!closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn closed_queue_releases_the_connection() {
        let events = EventQueue::unbounded();
        events.destroy().await.unwrap();
        let peers = QueuedPeerManager::new(events);
        let (conn, closed) = stub();

        peers.handle_new_cer(cer(), conn).await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn backlog_alarm_attaches_to_any_queue() {
        let events: EventQueue<u32> = EventQueue::unbounded();
        events.set_thresholds(2, 1, BacklogAlarm::new("test")).unwrap();
        for i in 0..4 {
            events.push(i).await.unwrap();
        }
        assert_eq!(events.stats().highest, Some(4));
    }
}
