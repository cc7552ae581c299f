//! Diameter node connection acceptor and inter-task event queue.

pub mod codec;
pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod peer;
pub mod queue;

pub use config::DaemonConfig;
pub use lifecycle::{Shutdown, ShutdownReason};
pub use queue::EventQueue;
