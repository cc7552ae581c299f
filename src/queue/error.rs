//! Queue error types.

use std::fmt;

use thiserror::Error;

/// Errors returned by [`EventQueue`](super::EventQueue) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// `try_pop` found the queue empty.
    #[error("queue is empty")]
    WouldBlock,

    /// `pop_timed` reached its deadline without an item.
    #[error("timed out waiting for an item")]
    Timeout,

    /// The queue has been destroyed (end of queue).
    #[error("queue has been destroyed")]
    Closed,

    /// `destroy` was called on a queue that still holds items.
    #[error("queue still holds {0} item(s)")]
    NotEmpty(usize),

    /// A watermark handler is attached and must be cleared first.
    #[error("a watermark handler is still attached")]
    WatermarkAttached,

    /// `set_thresholds` was called twice.
    #[error("watermark thresholds are already configured")]
    ThresholdsAlreadySet,

    /// `high` must be strictly greater than `low`.
    #[error("invalid thresholds: high ({high}) must be greater than low ({low})")]
    InvalidThresholds {
        /// Requested high threshold.
        high: usize,
        /// Requested low threshold.
        low: usize,
    },

    /// Producers are blocked pushing into the source of a move.
    #[error("{0} producer(s) are blocked on the source queue")]
    ProducersBlocked(usize),

    /// The move target is bounded and cannot hold both queues' items.
    #[error("move target holds at most {capacity} item(s), {needed} needed")]
    TargetFull {
        /// Capacity of the target queue.
        capacity: usize,
        /// Items the target would hold after the move.
        needed: usize,
    },

    /// The move target is the source itself, or a queue that already redirects.
    #[error("invalid move target")]
    InvalidMoveTarget,
}

/// A failed push. The rejected item is handed back to the caller.
pub struct PushError<T> {
    item: T,
    reason: QueueError,
}

impl<T> PushError<T> {
    pub(crate) fn new(item: T, reason: QueueError) -> Self {
        Self { item, reason }
    }

    /// Why the push failed.
    pub fn reason(&self) -> QueueError {
        self.reason
    }

    /// Recover the item that could not be queued.
    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushError")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "push rejected: {}", self.reason)
    }
}

impl<T> std::error::Error for PushError<T> {}
