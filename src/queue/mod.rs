//! Inter-task event queues.
//!
//! # Data Flow
//! ```text
//! producer tasks ──push──▶ EventQueue ──pop──▶ consumer tasks
//!                     │                  │
//!          (capacity reached:      (empty: consumer
//!           producer waits)         waits, or times out)
//!                     │
//!              watermark handler (high / low crossings,
//!              invoked with the queue lock released)
//! ```
//!
//! # Design Decisions
//! - One mutex per queue; no lock is held across an await point
//! - Bounded push protects memory; watermarks let the owner throttle itself
//! - Destruction is a typed state (`QueueError::Closed`), never a dangling handle
//! - `move_into` turns the source into a redirect so no in-flight item is lost

pub mod error;
pub mod fifo;
pub mod watermark;

pub use error::{PushError, QueueError};
pub use fifo::{EventQueue, QueueStats};
pub use watermark::WatermarkHandler;
