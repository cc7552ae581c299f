//! Connection context handed between the acceptor and the peer layer.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Own one accepted socket plus its optional TLS session
//! - Receive exactly one framed message at a time
//! - Release the socket exactly once, whoever ends up owning it

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use super::framing::read_frame;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport protocol of a listener or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Sctp => f.write_str("SCTP"),
        }
    }
}

/// When TLS starts on an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Security {
    /// TLS handshake right after accept (secure port).
    TlsImmediate,
    /// Clear at first; TLS may be negotiated later by the peer layer.
    Clear,
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Security::TlsImmediate => f.write_str("tls"),
            Security::Clear => f.write_str("clear"),
        }
    }
}

/// Errors surfaced by connection I/O.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS handshake failed: {0}")]
    Tls(io::Error),

    #[error("no TLS credentials for this connection")]
    TlsUnavailable,

    #[error("invalid frame: {0}")]
    Framing(String),

    #[error("connection closed")]
    Closed,
}

/// An accepted connection, owned by exactly one party at a time.
///
/// The acceptor owns it until the first message has been validated; after
/// that ownership moves to the peer layer together with the message.
#[async_trait]
pub trait Connection: Send {
    fn id(&self) -> ConnectionId;

    /// Human readable label, e.g. `TCP/TLS [::1]:5001 -> [::1]:3869 (conn-7)`.
    fn description(&self) -> &str;

    fn protocol(&self) -> Protocol;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Whether a TLS session is established.
    fn is_tls(&self) -> bool;

    /// Run the server side of the TLS handshake.
    async fn handshake(&mut self) -> Result<(), ConnectionError>;

    /// Read one complete Diameter message.
    async fn receive(&mut self) -> Result<Bytes, ConnectionError>;

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Shut the connection down. Calling it again has no effect.
    async fn close(&mut self);

    fn is_closed(&self) -> bool;
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Closed,
}

/// TCP implementation of [`Connection`], upgraded in place by `handshake`.
pub struct TcpConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    description: String,
    stream: Stream,
    tls: Option<TlsAcceptor>,
    max_message_size: usize,
}

impl TcpConnection {
    pub fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        max_message_size: usize,
    ) -> Self {
        let id = ConnectionId::new();
        let kind = if tls.is_some() { "TCP/TLS" } else { "TCP" };
        Self {
            id,
            peer_addr,
            description: format!("{kind} {peer_addr} -> {local_addr} ({id})"),
            stream: Stream::Plain(stream),
            tls,
            max_message_size,
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
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
        Some(self.peer_addr)
    }

    fn is_tls(&self) -> bool {
        matches!(self.stream, Stream::Tls(_))
    }

    async fn handshake(&mut self) -> Result<(), ConnectionError> {
        let Some(acceptor) = self.tls.clone() else {
            return Err(ConnectionError::TlsUnavailable);
        };
        // A dropped handshake future leaves the connection closed.
        match std::mem::replace(&mut self.stream, Stream::Closed) {
            Stream::Plain(tcp) => {
                let tls = acceptor.accept(tcp).await.map_err(ConnectionError::Tls)?;
                self.stream = Stream::Tls(Box::new(tls));
                Ok(())
            }
            established @ Stream::Tls(_) => {
                self.stream = established;
                Ok(())
            }
            Stream::Closed => Err(ConnectionError::Closed),
        }
    }

    async fn receive(&mut self) -> Result<Bytes, ConnectionError> {
        match &mut self.stream {
            Stream::Plain(tcp) => read_frame(tcp, self.max_message_size).await,
            Stream::Tls(tls) => read_frame(tls.as_mut(), self.max_message_size).await,
            Stream::Closed => Err(ConnectionError::Closed),
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        match &mut self.stream {
            Stream::Plain(tcp) => {
                tcp.write_all(data).await?;
                tcp.flush().await?;
            }
            Stream::Tls(tls) => {
                tls.write_all(data).await?;
                tls.flush().await?;
            }
            Stream::Closed => return Err(ConnectionError::Closed),
        }
        Ok(())
    }

    async fn close(&mut self) {
        match std::mem::replace(&mut self.stream, Stream::Closed) {
            Stream::Plain(mut tcp) => {
                let _ = tcp.shutdown().await;
            }
            Stream::Tls(mut tls) => {
                let _ = tls.shutdown().await;
            }
            Stream::Closed => return,
        }
        tracing::trace!(connection = %self.id, "Connection closed");
    }

    fn is_closed(&self) -> bool {
        matches!(self.stream, Stream::Closed)
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageBuilder;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (TcpConnection::new(server, peer, addr, None, 4096), client)
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn receives_one_frame_at_a_time() {
        let (mut conn, mut client) = pair().await;
        let first = MessageBuilder::device_watchdog_request("a", "b").build();
        let second = MessageBuilder::device_watchdog_request("c", "d").build();
        client.write_all(&first).await.unwrap();
        client.write_all(&second).await.unwrap();

        assert_eq!(conn.receive().await.unwrap(), first);
        assert_eq!(conn.receive().await.unwrap(), second);
        assert!(conn.description().starts_with("TCP 127.0.0.1:"));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_visible_to_peer() {
        let (mut conn, mut client) = pair().await;
        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        assert!(matches!(conn.receive().await, Err(ConnectionError::Closed)));

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn handshake_without_credentials_fails() {
        let (mut conn, _client) = pair().await;
        assert!(matches!(
            conn.handshake().await,
            Err(ConnectionError::TlsUnavailable)
        ));
        assert!(!conn.is_closed());
    }
}
