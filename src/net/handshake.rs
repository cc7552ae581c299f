//! Per-connection state machine from accept to CER hand-off.
//!
//! # Responsibilities
//! - Run the TLS handshake on secure listeners
//! - Wait for the first message, bounded by the incoming-connection deadline
//! - Parse and validate it, insist on a base-protocol CER
//! - Hand the message and connection to the peer layer, or close the connection
//!
//! # Data Flow
//! ```text
//! Accepted → [TlsHandshaking] → AwaitingFirstMessage → Parsing → ValidatingCer
//!     → HandedOff | Rejected
//! (listener stop / daemon shutdown at any wait → Cancelled)
//! ```
//!
//! # Design Decisions
//! - The deadline is measured from accept, TLS time included
//! - Leaving the outstanding set (`claim`) decides who owns the connection:
//!   if the listener drained the entry first, the handshake closes the
//!   connection; if the handshake claimed first, the hand-off runs outside
//!   any cancellation and the listener never sees it again

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::connection::{Connection, ConnectionId, Security};
use crate::codec::{CodecError, DiameterMessage, MessageCodec};
use crate::lifecycle::{Shutdown, ShutdownReason};
use crate::observability::metrics;
use crate::peer::PeerManager;

/// Fixed time from accept to a validated CER.
pub const DEFAULT_INCOMING_TIMEOUT: Duration = Duration::from_secs(20);

/// Collaborators shared by every handshake of a listener.
#[derive(Clone)]
pub struct AcceptContext {
    pub codec: Arc<dyn MessageCodec>,
    pub peers: Arc<dyn PeerManager>,
    pub shutdown: Shutdown,
    pub incoming_timeout: Duration,
}

impl AcceptContext {
    pub fn new(codec: Arc<dyn MessageCodec>, peers: Arc<dyn PeerManager>, shutdown: Shutdown) -> Self {
        Self {
            codec,
            peers,
            shutdown,
            incoming_timeout: DEFAULT_INCOMING_TIMEOUT,
        }
    }

    pub fn with_incoming_timeout(mut self, timeout: Duration) -> Self {
        self.incoming_timeout = timeout;
        self
    }
}

/// Why a connection was turned away. Never escalated beyond the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("TLS handshake failed: {0}")]
    TlsFailed(String),

    #[error("no message before the deadline")]
    Timeout,

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("unparsable message: {0}")]
    Parse(String),

    #[error("invalid message: {0}")]
    Validation(String),

    #[error("first message is not a CER (command {command_code}, application {application_id}, request {request})")]
    NotCer {
        command_code: u32,
        application_id: u32,
        request: bool,
    },
}

/// Terminal state of one handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Message and connection now belong to the peer layer.
    HandedOff,
    /// The connection was closed because of the peer.
    Rejected(RejectReason),
    /// The listener or the daemon stopped first; the connection was closed.
    Cancelled,
    /// Our own side failed; the connection was closed and the daemon told to stop.
    Fatal(String),
}

impl HandshakeOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            HandshakeOutcome::HandedOff => "handed_off",
            HandshakeOutcome::Rejected(RejectReason::Timeout) => "timeout",
            HandshakeOutcome::Rejected(_) => "rejected",
            HandshakeOutcome::Cancelled => "cancelled",
            HandshakeOutcome::Fatal(_) => "fatal",
        }
    }
}

/// Diagnostic view of one outstanding handshake.
#[derive(Debug, Clone, Serialize)]
pub struct PendingSnapshot {
    pub connection: String,
    pub description: String,
    pub remaining_ms: u64,
}

pub(crate) struct Outstanding {
    pub(crate) description: String,
    pub(crate) deadline: Instant,
    pub(crate) token: CancellationToken,
    pub(crate) task: Option<JoinHandle<HandshakeOutcome>>,
}

/// Handshakes a listener has started and not yet finished.
pub struct PendingHandshakes {
    listener: String,
    entries: Mutex<HashMap<ConnectionId, Outstanding>>,
}

impl PendingHandshakes {
    pub fn new(listener: impl Into<String>) -> Self {
        Self {
            listener: listener.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn listener(&self) -> &str {
        &self.listener
    }

    pub(crate) fn register(
        &self,
        id: ConnectionId,
        description: String,
        deadline: Instant,
        token: CancellationToken,
    ) {
        let count = {
            let mut entries = self.entries.lock();
            entries.insert(
                id,
                Outstanding {
                    description,
                    deadline,
                    token,
                    task: None,
                },
            );
            entries.len()
        };
        metrics::set_pending_handshakes(&self.listener, count);
    }

    /// Record the task running `id`. If the handshake already left the set
    /// the handle is simply dropped.
    pub(crate) fn attach(&self, id: ConnectionId, task: JoinHandle<HandshakeOutcome>) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.task = Some(task);
        }
    }

    /// Leave the set. `false` means the listener already took the entry and
    /// the caller must not hand the connection off.
    pub(crate) fn claim(&self, id: ConnectionId) -> bool {
        let (claimed, count) = {
            let mut entries = self.entries.lock();
            let claimed = entries.remove(&id).is_some();
            (claimed, entries.len())
        };
        if claimed {
            metrics::set_pending_handshakes(&self.listener, count);
        }
        claimed
    }

    /// Take every entry at once.
    pub(crate) fn drain(&self) -> Vec<Outstanding> {
        let drained: Vec<_> = self.entries.lock().drain().map(|(_, entry)| entry).collect();
        metrics::set_pending_handshakes(&self.listener, 0);
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<PendingSnapshot> {
        let now = Instant::now();
        let mut pending: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.description.clone(), entry.deadline))
            .collect();
        pending.sort_by_key(|(id, _, _)| *id);
        pending
            .into_iter()
            .map(|(id, description, deadline)| PendingSnapshot {
                connection: id.to_string(),
                description,
                remaining_ms: deadline.saturating_duration_since(now).as_millis() as u64,
            })
            .collect()
    }
}

enum Failure {
    Reject(RejectReason),
    Internal(String),
}

/// One accepted connection waiting for its CER.
pub struct PendingHandshake {
    connection: Box<dyn Connection>,
    security: Security,
    deadline: Instant,
    token: CancellationToken,
    pending: Arc<PendingHandshakes>,
    ctx: AcceptContext,
}

impl PendingHandshake {
    pub(crate) fn new(
        connection: Box<dyn Connection>,
        security: Security,
        deadline: Instant,
        token: CancellationToken,
        pending: Arc<PendingHandshakes>,
        ctx: AcceptContext,
    ) -> Self {
        Self {
            connection,
            security,
            deadline,
            token,
            pending,
            ctx,
        }
    }

    /// Drive the state machine to completion.
    pub async fn run(self) -> HandshakeOutcome {
        let span = tracing::info_span!(
            "handshake",
            connection = %self.connection.id(),
            listener = %self.pending.listener(),
        );
        let started = std::time::Instant::now();
        let outcome = self.drive().instrument(span).await;
        metrics::record_handshake(outcome.label(), started.elapsed());
        outcome
    }

    async fn drive(self) -> HandshakeOutcome {
        let Self {
            mut connection,
            security,
            deadline,
            token,
            pending,
            ctx,
        } = self;
        let id = connection.id();
        tracing::debug!(peer = %connection.description(), "Waiting for CER");

        let received = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = tokio::time::timeout_at(
                deadline,
                await_cer(connection.as_mut(), security, ctx.codec.as_ref()),
            ) => Some(result.unwrap_or(Err(Failure::Reject(RejectReason::Timeout)))),
        };

        match received {
            None => {
                pending.claim(id);
                connection.close().await;
                tracing::debug!("Handshake cancelled, connection closed");
                HandshakeOutcome::Cancelled
            }
            Some(Ok(message)) => {
                if !pending.claim(id) {
                    connection.close().await;
                    tracing::debug!("Listener stopping, CER discarded");
                    return HandshakeOutcome::Cancelled;
                }
                tracing::info!(
                    origin_host = message.origin_host().unwrap_or("-"),
                    origin_realm = message.origin_realm().unwrap_or("-"),
                    peer = %connection.description(),
                    "CER received, handing connection to peer layer"
                );
                ctx.peers.handle_new_cer(message, connection).await;
                HandshakeOutcome::HandedOff
            }
            Some(Err(Failure::Reject(reason))) => {
                pending.claim(id);
                connection.close().await;
                tracing::info!(
                    peer = %connection.description(),
                    reason = %reason,
                    "Connection rejected"
                );
                HandshakeOutcome::Rejected(reason)
            }
            Some(Err(Failure::Internal(what))) => {
                pending.claim(id);
                connection.close().await;
                tracing::error!(error = %what, "Handshake failed on our side");
                ctx.shutdown.trigger(ShutdownReason::Internal { what: what.clone() });
                HandshakeOutcome::Fatal(what)
            }
        }
    }
}

async fn await_cer(
    connection: &mut dyn Connection,
    security: Security,
    codec: &dyn MessageCodec,
) -> Result<DiameterMessage, Failure> {
    if security == Security::TlsImmediate {
        connection
            .handshake()
            .await
            .map_err(|e| Failure::Reject(RejectReason::TlsFailed(e.to_string())))?;
        tracing::debug!("TLS established");
    }

    let raw = connection
        .receive()
        .await
        .map_err(|e| Failure::Reject(RejectReason::Receive(e.to_string())))?;

    let message = codec.parse(raw).map_err(|e| codec_failure(e, RejectReason::Parse))?;
    codec
        .validate(&message)
        .map_err(|e| codec_failure(e, RejectReason::Validation))?;

    let header = codec.header(&message);
    if !header.is_capabilities_exchange_request() {
        return Err(Failure::Reject(RejectReason::NotCer {
            command_code: header.command_code,
            application_id: header.application_id,
            request: header.is_request(),
        }));
    }
    Ok(message)
}

fn codec_failure(err: CodecError, reject: fn(String) -> RejectReason) -> Failure {
    if err.is_fatal() {
        Failure::Internal(err.to_string())
    } else {
        Failure::Reject(reject(err.to_string()))
    }
}
