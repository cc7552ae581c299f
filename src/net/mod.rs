//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! registry.rs (plan endpoints, start/stop all listeners)
//!     → listener.rs (accept loop per endpoint)
//!     → connection.rs (ConnectionContext around the accepted socket)
//!     → handshake.rs (TLS, first message, CER check, deadline)
//!     → Hand off to the peer layer
//!
//! Handshake states:
//!     Accepted → [TlsHandshaking] → AwaitingFirstMessage → Parsing
//!         → ValidatingCer → HandedOff | Rejected
//! ```
//!
//! # Design Decisions
//! - Every outstanding handshake is tracked so shutdown can cancel it
//! - Cancellation flows through a token hierarchy: daemon → listener → handshake
//! - TLS is per-listener and happens inside the handshake deadline

pub mod connection;
pub mod framing;
pub mod handshake;
pub mod listener;
pub mod registry;
pub mod tls;

pub use connection::{Connection, ConnectionError, ConnectionId, Protocol, Security, TcpConnection};
pub use handshake::{AcceptContext, HandshakeOutcome, PendingHandshakes, RejectReason};
pub use listener::{Acceptor, ListenerError, ListenerService, ListenerStatus, TcpAcceptor};
pub use registry::{plan_listeners, ListenerRegistry, ListenerSpec};
