//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Peer event queue → TLS credentials → Listeners → Event consumer
//!
//! Shutdown (shutdown.rs):
//!     Terminate event → Stop listeners → Stop consumer → Destroy queue
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: queue first, listeners last
//! - Ordered shutdown: stop accept, cancel handshakes, drain, destroy
//! - Any component may raise the terminate event; the first reason is kept

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{Shutdown, ShutdownReason};
pub use startup::{run_daemon, Daemon, StartupError};
