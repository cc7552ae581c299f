//! Listening sockets and the accept loop.
//!
//! # Responsibilities
//! - Bind one (address, protocol, security) endpoint
//! - Accept incoming connections and start a handshake for each
//! - Track outstanding handshakes until they finish or are cancelled
//! - Stop synchronously: accept loop first, then every outstanding handshake
//!
//! # Design Decisions
//! - One task per listener, one task per pending handshake
//! - An accept failure takes the listener to `Error` and raises the daemon
//!   shutdown; one bad client never does

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::connection::{Connection, Protocol, Security, TcpConnection};
use super::handshake::{AcceptContext, PendingHandshake, PendingHandshakes, PendingSnapshot};
use crate::lifecycle::ShutdownReason;
use crate::observability::metrics;

/// Pending-connection backlog passed to `listen(2)`.
const LISTEN_BACKLOG: u32 = 1024;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept: {0}")]
    Accept(#[source] io::Error),

    #[error("{protocol} listeners are not supported ({addr})")]
    Unsupported { protocol: Protocol, addr: SocketAddr },

    #[error("TLS listener on {0} has no credentials")]
    TlsNotConfigured(SocketAddr),

    #[error("listener {label} cannot start from status {status:?}")]
    NotStartable { label: String, status: ListenerStatus },
}

impl ListenerError {
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, ListenerError::Bind { source, .. } if source.kind() == io::ErrorKind::AddrInUse)
    }
}

/// Source of accepted connections for one listener.
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self) -> io::Result<Box<dyn Connection>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn protocol(&self) -> Protocol;
}

/// TCP acceptor. Wraps TLS credentials for secure listeners.
pub struct TcpAcceptor {
    inner: TcpListener,
    tls: Option<TlsAcceptor>,
    max_message_size: usize,
}

impl TcpAcceptor {
    /// Bind and listen on `addr`.
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        max_message_size: usize,
    ) -> Result<Self, ListenerError> {
        let bind_err = |source| ListenerError::Bind { addr, source };
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let inner = socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

        tracing::debug!(address = %addr, tls = tls.is_some(), "Listener bound");
        Ok(Self {
            inner,
            tls,
            max_message_size,
        })
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> io::Result<Box<dyn Connection>> {
        let (stream, peer_addr) = self.inner.accept().await?;
        let _ = stream.set_nodelay(true);
        let local_addr = stream.local_addr().or_else(|_| self.inner.local_addr())?;
        Ok(Box::new(TcpConnection::new(
            stream,
            peer_addr,
            local_addr,
            self.tls.clone(),
            self.max_message_size,
        )))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }
}

/// Lifecycle of a listener. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerStatus {
    NotStarted,
    Running,
    Terminated,
    Error,
}

impl ListenerStatus {
    fn can_become(self, next: ListenerStatus) -> bool {
        use ListenerStatus::*;
        matches!(
            (self, next),
            (NotStarted, Running) | (NotStarted, Terminated) | (NotStarted, Error) | (Running, Terminated) | (Running, Error)
        )
    }
}

/// Diagnostic view of a listener.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerSnapshot {
    pub label: String,
    pub protocol: Protocol,
    pub security: Security,
    pub local_addr: SocketAddr,
    pub status: ListenerStatus,
    pub pending: Vec<PendingSnapshot>,
}

/// One listening endpoint and the handshakes it has in flight.
pub struct ListenerService {
    label: String,
    protocol: Protocol,
    security: Security,
    local_addr: SocketAddr,
    status: Mutex<ListenerStatus>,
    acceptor: Mutex<Option<Box<dyn Acceptor>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<PendingHandshakes>,
    token: CancellationToken,
    ctx: AcceptContext,
}

impl ListenerService {
    pub fn new(
        acceptor: Box<dyn Acceptor>,
        security: Security,
        ctx: AcceptContext,
    ) -> Result<Arc<Self>, ListenerError> {
        let protocol = acceptor.protocol();
        let local_addr = acceptor.local_addr().map_err(ListenerError::Accept)?;
        let label = match security {
            Security::TlsImmediate => format!("{protocol}/TLS {local_addr}"),
            Security::Clear => format!("{protocol} {local_addr}"),
        };
        Ok(Arc::new(Self {
            pending: Arc::new(PendingHandshakes::new(label.clone())),
            label,
            protocol,
            security,
            local_addr,
            status: Mutex::new(ListenerStatus::NotStarted),
            acceptor: Mutex::new(Some(acceptor)),
            accept_task: Mutex::new(None),
            token: ctx.shutdown.child_token(),
            ctx,
        }))
    }

    /// Spawn the accept loop.
    pub fn start(self: &Arc<Self>) -> Result<(), ListenerError> {
        let acceptor = {
            let mut status = self.status.lock();
            let acceptor = self.acceptor.lock().take();
            match acceptor {
                Some(acceptor) if status.can_become(ListenerStatus::Running) => {
                    *status = ListenerStatus::Running;
                    acceptor
                }
                _ => {
                    return Err(ListenerError::NotStartable {
                        label: self.label.clone(),
                        status: *status,
                    })
                }
            }
        };

        let task = tokio::spawn(Arc::clone(self).accept_loop(acceptor));
        *self.accept_task.lock() = Some(task);
        tracing::info!(listener = %self.label, "Listening for connections");
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, acceptor: Box<dyn Acceptor>) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                result = acceptor.accept() => result,
            };
            match accepted {
                Ok(connection) => self.dispatch(connection),
                Err(e) if is_transient(&e) => {
                    tracing::debug!(listener = %self.label, error = %e, "Transient accept error");
                }
                Err(e) => {
                    tracing::error!(listener = %self.label, error = %e, "Accept failed, listener stopped");
                    self.advance(ListenerStatus::Error);
                    self.ctx.shutdown.trigger(ShutdownReason::ListenerFailed {
                        listener: self.label.clone(),
                    });
                    break;
                }
            }
        }
        // Dropping the acceptor closes the listening socket.
        drop(acceptor);
        tracing::debug!(listener = %self.label, "Accept loop exited");
    }

    fn dispatch(&self, connection: Box<dyn Connection>) {
        let id = connection.id();
        metrics::record_connection_accepted(self.protocol, self.security);
        tracing::debug!(listener = %self.label, peer = %connection.description(), "Connection accepted");

        let deadline = Instant::now() + self.ctx.incoming_timeout;
        let token = self.token.child_token();
        self.pending
            .register(id, connection.description().to_string(), deadline, token.clone());

        let handshake = PendingHandshake::new(
            connection,
            self.security,
            deadline,
            token,
            Arc::clone(&self.pending),
            self.ctx.clone(),
        );
        let task = tokio::spawn(handshake.run());
        self.pending.attach(id, task);
    }

    /// Stop accepting and cancel every outstanding handshake. Returns once
    /// the listening socket is closed and each cancelled handshake has
    /// closed its connection. Safe to call more than once.
    pub async fn stop(&self) {
        self.token.cancel();

        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                tracing::warn!(listener = %self.label, error = %e, "Accept loop did not exit cleanly");
            }
        }
        self.acceptor.lock().take();

        let drained = self.pending.drain();
        for entry in &drained {
            entry.token.cancel();
        }
        let cancelled = drained.len();
        for entry in drained {
            if let Some(task) = entry.task {
                if let Err(e) = task.await {
                    tracing::warn!(
                        listener = %self.label,
                        connection = %entry.description,
                        error = %e,
                        "Handshake task did not exit cleanly"
                    );
                }
            }
        }

        if self.advance(ListenerStatus::Terminated) {
            tracing::info!(listener = %self.label, cancelled, "Listener stopped");
        }
    }

    /// Move to `next` if the transition is allowed.
    fn advance(&self, next: ListenerStatus) -> bool {
        let mut status = self.status.lock();
        if status.can_become(next) {
            *status = next;
            true
        } else {
            false
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn status(&self) -> ListenerStatus {
        *self.status.lock()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn security(&self) -> Security {
        self.security
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn snapshot(&self) -> ListenerSnapshot {
        ListenerSnapshot {
            label: self.label.clone(),
            protocol: self.protocol,
            security: self.security,
            local_addr: self.local_addr,
            status: self.status(),
            pending: self.pending.snapshot(),
        }
    }
}

/// Errors caused by a single client that leave the socket usable.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
