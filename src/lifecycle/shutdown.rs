//! Shutdown coordination for the daemon.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Why the daemon is terminating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShutdownReason {
    /// SIGINT / SIGTERM.
    Signal { name: String },
    /// Asked for programmatically.
    Requested,
    /// A listener could not bind or its accept loop failed.
    ListenerFailed { listener: String },
    /// Our own logic or resources broke.
    Internal { what: String },
}

impl ShutdownReason {
    /// Whether the process should exit with a failure status.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShutdownReason::ListenerFailed { .. } | ShutdownReason::Internal { .. }
        )
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal { name } => write!(f, "received {}", name),
            ShutdownReason::Requested => write!(f, "shutdown requested"),
            ShutdownReason::ListenerFailed { listener } => write!(f, "listener {} failed", listener),
            ShutdownReason::Internal { what } => write!(f, "internal error: {}", what),
        }
    }
}

/// Process-wide terminate event.
///
/// Cheap to clone; every clone observes the same event. The first reason
/// passed to [`Shutdown::trigger`] is kept, later ones are only logged.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the terminate event. Returns `false` if it was already raised.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        {
            let mut slot = self.reason.lock();
            if let Some(first) = slot.as_ref() {
                tracing::debug!(%reason, first = %first, "Shutdown already in progress");
                return false;
            }
            if reason.is_fatal() {
                tracing::error!(%reason, "Shutting down");
            } else {
                tracing::info!(%reason, "Shutting down");
            }
            *slot = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the event has been raised.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// A token cancelled with the daemon, or earlier on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// The first recorded reason, if any.
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().clone()
    }
}
