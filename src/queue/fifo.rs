//! Bounded FIFO queue with blocking, timed and non-blocking consumption.
//!
//! # Responsibilities
//! - Preserve push order across any number of producers and consumers
//! - Suspend producers while a bounded queue is full
//! - Report watermark crossings to an attached [`WatermarkHandler`]
//! - Surface destruction to every current and future caller as `Closed`
//! - Splice one queue into another without losing in-flight items

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::error::{PushError, QueueError};
use super::watermark::{Watermark, WatermarkHandler};

/// Source of queue identities; also the global lock order used by `move_into`.
static QUEUE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// How long `destroy` waits for woken consumers to detach.
const DETACH_POLL: Duration = Duration::from_millis(1);
const DETACH_ATTEMPTS: usize = 20;

/// Handle to a shared FIFO queue. Clones refer to the same queue.
pub struct EventQueue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    id: u64,
    state: Mutex<State<T>>,
    /// Consumers waiting for an item.
    readable: Notify,
    /// Producers waiting for room.
    writable: Notify,
    /// Depth mirror for lock-free diagnostics.
    approx_len: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Destroyed,
}

struct State<T> {
    lifecycle: Lifecycle,
    items: VecDeque<T>,
    capacity: usize,
    pop_waiters: usize,
    push_waiters: usize,
    watermark: Option<Watermark<T>>,
    highest_ever: usize,
    /// Set by `move_into`: every operation is served by this queue instead.
    redirect: Option<EventQueue<T>>,
}

/// Point-in-time view of a queue, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub len: usize,
    /// 0 means unbounded.
    pub capacity: usize,
    pub waiting_consumers: usize,
    pub waiting_producers: usize,
    pub high: Option<usize>,
    pub low: Option<usize>,
    /// Depth at the last unacknowledged high crossing.
    pub highest: Option<usize>,
    pub highest_ever: usize,
    pub closed: bool,
}

type Handler<T> = Arc<dyn WatermarkHandler<T>>;

impl<T> EventQueue<T> {
    /// Create an empty queue. A `capacity` of 0 means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: QUEUE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(State {
                    lifecycle: Lifecycle::Open,
                    items: VecDeque::new(),
                    capacity,
                    pop_waiters: 0,
                    push_waiters: 0,
                    watermark: None,
                    highest_ever: 0,
                    redirect: None,
                }),
                readable: Notify::new(),
                writable: Notify::new(),
                approx_len: AtomicUsize::new(0),
            }),
        }
    }

    /// Create an unbounded queue.
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Append an item, waiting for room if the queue is bounded and full.
    ///
    /// Dropping the returned future while it waits withdraws the producer
    /// cleanly. On a destroyed queue the item is handed back in the error.
    pub async fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut target = self.clone();
        loop {
            let shared = Arc::clone(&target.shared);
            let notified = shared.writable.notified();
            tokio::pin!(notified);

            // The guard must not live across an await.
            let next = {
                let mut state = shared.state.lock();
                if state.lifecycle == Lifecycle::Destroyed {
                    return Err(PushError::new(item, QueueError::Closed));
                }
                if let Some(queue) = state.redirect.clone() {
                    Next::Follow(queue)
                } else if state.capacity > 0 && state.items.len() >= state.capacity {
                    notified.as_mut().enable();
                    state.push_waiters += 1;
                    Next::Wait
                } else {
                    let high = target.enqueue_locked(&mut state, item);
                    drop(state);
                    if let Some(handler) = high {
                        handler.on_high(&target);
                    }
                    return Ok(());
                }
            };

            match next {
                Next::Follow(queue) => target = queue,
                Next::Wait => {
                    let _waiter = Waiter::new(&shared, Side::Push);
                    notified.await;
                }
            }
        }
    }

    /// Remove the head item, waiting as long as it takes.
    pub async fn pop(&self) -> Result<T, QueueError> {
        self.pop_until(None).await
    }

    /// Remove the head item, giving up with `Timeout` at `deadline`.
    pub async fn pop_timed(&self, deadline: Instant) -> Result<T, QueueError> {
        self.pop_until(Some(deadline)).await
    }

    /// Remove the head item without waiting.
    pub fn try_pop(&self) -> Result<T, QueueError> {
        let (target, popped) = self.locked(|queue, state| {
            if state.lifecycle == Lifecycle::Destroyed {
                return Err(QueueError::Closed);
            }
            state
                .items
                .pop_front()
                .map(|item| (item, queue.after_dequeue_locked(state)))
                .ok_or(QueueError::WouldBlock)
        });
        let (item, low) = popped?;
        if let Some(handler) = low {
            handler.on_low(&target);
        }
        Ok(item)
    }

    async fn pop_until(&self, deadline: Option<Instant>) -> Result<T, QueueError> {
        let mut target = self.clone();
        loop {
            let shared = Arc::clone(&target.shared);
            let notified = shared.readable.notified();
            tokio::pin!(notified);

            let next = {
                let mut state = shared.state.lock();
                if state.lifecycle == Lifecycle::Destroyed {
                    return Err(QueueError::Closed);
                }
                if let Some(queue) = state.redirect.clone() {
                    Next::Follow(queue)
                } else if let Some(item) = state.items.pop_front() {
                    let low = target.after_dequeue_locked(&mut state);
                    drop(state);
                    if let Some(handler) = low {
                        handler.on_low(&target);
                    }
                    return Ok(item);
                } else {
                    notified.as_mut().enable();
                    state.pop_waiters += 1;
                    Next::Wait
                }
            };

            match next {
                Next::Follow(queue) => target = queue,
                Next::Wait => {
                    let _waiter = Waiter::new(&shared, Side::Pop);
                    match deadline {
                        Some(deadline) => {
                            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                                return Err(QueueError::Timeout);
                            }
                        }
                        None => notified.await,
                    }
                }
            }
        }
    }

    /// Current number of queued items (0 once destroyed).
    pub fn len(&self) -> usize {
        self.locked(|_, state| state.items.len()).1
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Depth without taking the lock. Best effort; ignores redirects.
    pub fn len_relaxed(&self) -> usize {
        self.shared.approx_len.load(Ordering::Relaxed)
    }

    /// Configured capacity (0 = unbounded).
    pub fn capacity(&self) -> usize {
        self.locked(|_, state| state.capacity).1
    }

    /// Attach a watermark handler. Allowed once; requires `high > low`.
    pub fn set_thresholds(
        &self,
        high: usize,
        low: usize,
        handler: Arc<dyn WatermarkHandler<T>>,
    ) -> Result<(), QueueError> {
        if high <= low {
            return Err(QueueError::InvalidThresholds { high, low });
        }
        self.locked(|_, state| {
            if state.watermark.is_some() {
                return Err(QueueError::ThresholdsAlreadySet);
            }
            state.watermark = Some(Watermark::new(high, low, handler));
            Ok(())
        })
        .1
    }

    /// Detach and return the watermark handler, if any.
    pub fn clear_thresholds(&self) -> Option<Arc<dyn WatermarkHandler<T>>> {
        self.locked(|_, state| state.watermark.take().map(|w| w.handler))
            .1
    }

    /// Splice every queued item into `other` and redirect this queue to it.
    ///
    /// Afterwards this queue is empty but alive: pushes, pops and lengths on
    /// any of its handles are served by `other`, and consumers that were
    /// waiting here continue waiting on `other`. Fails while producers are
    /// blocked here or while a watermark handler is attached here.
    pub fn move_into(&self, other: &EventQueue<T>) -> Result<(), QueueError> {
        if Arc::ptr_eq(&self.shared, &other.shared) {
            return Err(QueueError::InvalidMoveTarget);
        }

        let self_first = self.shared.id < other.shared.id;
        let (mut first, mut second) = if self_first {
            let a = self.shared.state.lock();
            (a, other.shared.state.lock())
        } else {
            let a = other.shared.state.lock();
            (a, self.shared.state.lock())
        };
        let (src, dst) = if self_first {
            (&mut *first, &mut *second)
        } else {
            (&mut *second, &mut *first)
        };

        if src.lifecycle == Lifecycle::Destroyed || dst.lifecycle == Lifecycle::Destroyed {
            return Err(QueueError::Closed);
        }
        if src.redirect.is_some() || dst.redirect.is_some() {
            return Err(QueueError::InvalidMoveTarget);
        }
        if src.watermark.is_some() {
            return Err(QueueError::WatermarkAttached);
        }
        if src.push_waiters > 0 {
            return Err(QueueError::ProducersBlocked(src.push_waiters));
        }
        let needed = dst.items.len() + src.items.len();
        if dst.capacity > 0 && needed > dst.capacity {
            return Err(QueueError::TargetFull {
                capacity: dst.capacity,
                needed,
            });
        }

        let moved = src.items.len();
        dst.items.append(&mut src.items);
        let count = dst.items.len();
        dst.highest_ever = dst.highest_ever.max(count);
        src.redirect = Some(other.clone());
        self.shared.approx_len.store(0, Ordering::Relaxed);
        other.shared.approx_len.store(count, Ordering::Relaxed);

        for _ in 0..moved.min(dst.pop_waiters) {
            other.shared.readable.notify_one();
        }
        // Consumers parked here re-check and follow the redirect.
        self.shared.readable.notify_waiters();

        let high = dst
            .watermark
            .as_mut()
            .and_then(|w| w.absorbed(count).then(|| Arc::clone(&w.handler)));

        drop(first);
        drop(second);

        tracing::debug!(
            source = self.shared.id,
            target = other.shared.id,
            moved,
            depth = count,
            "Queue contents moved"
        );

        if let Some(handler) = high {
            handler.on_high(other);
        }
        Ok(())
    }

    /// Invalidate an empty queue.
    ///
    /// Every consumer currently waiting is woken and returns `Closed`, as
    /// does every later call through any handle.
    pub async fn destroy(&self) -> Result<(), QueueError> {
        {
            let mut state = self.shared.state.lock();
            if state.lifecycle == Lifecycle::Destroyed {
                return Err(QueueError::Closed);
            }
            if !state.items.is_empty() {
                return Err(QueueError::NotEmpty(state.items.len()));
            }
            if state.watermark.is_some() {
                return Err(QueueError::WatermarkAttached);
            }
            state.lifecycle = Lifecycle::Destroyed;
            state.redirect = None;
        }
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();

        for _ in 0..DETACH_ATTEMPTS {
            if self.shared.state.lock().pop_waiters == 0 {
                return Ok(());
            }
            tokio::time::sleep(DETACH_POLL).await;
        }
        tracing::warn!(
            queue = self.shared.id,
            waiting = self.shared.state.lock().pop_waiters,
            "Consumers still attached to destroyed queue"
        );
        Ok(())
    }

    /// Whether `destroy` has been called on this queue.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().lifecycle == Lifecycle::Destroyed
    }

    /// Snapshot of depth, waiters and watermark state.
    pub fn stats(&self) -> QueueStats {
        self.locked(|_, state| QueueStats {
            len: state.items.len(),
            capacity: state.capacity,
            waiting_consumers: state.pop_waiters,
            waiting_producers: state.push_waiters,
            high: state.watermark.as_ref().map(|w| w.high),
            low: state.watermark.as_ref().map(|w| w.low),
            highest: state.watermark.as_ref().map(|w| w.highest),
            highest_ever: state.highest_ever,
            closed: state.lifecycle == Lifecycle::Destroyed,
        })
        .1
    }

    /// Run `f` under the lock of the queue that actually serves this handle.
    fn locked<R>(&self, f: impl FnOnce(&EventQueue<T>, &mut State<T>) -> R) -> (EventQueue<T>, R) {
        let mut target = self.clone();
        loop {
            let shared = Arc::clone(&target.shared);
            let mut state = shared.state.lock();
            if state.lifecycle == Lifecycle::Open {
                if let Some(next) = state.redirect.clone() {
                    drop(state);
                    target = next;
                    continue;
                }
            }
            let result = f(&target, &mut *state);
            drop(state);
            return (target, result);
        }
    }

    fn enqueue_locked(&self, state: &mut State<T>, item: T) -> Option<Handler<T>> {
        state.items.push_back(item);
        let count = state.items.len();
        state.highest_ever = state.highest_ever.max(count);
        self.shared.approx_len.store(count, Ordering::Relaxed);

        if state.pop_waiters > 0 {
            self.shared.readable.notify_one();
        }
        if state.push_waiters > 0 && (state.capacity == 0 || count < state.capacity) {
            // Cascade to the next blocked producer.
            self.shared.writable.notify_one();
        }

        state
            .watermark
            .as_mut()
            .and_then(|w| w.crossed_up(count).then(|| Arc::clone(&w.handler)))
    }

    fn after_dequeue_locked(&self, state: &mut State<T>) -> Option<Handler<T>> {
        let count = state.items.len();
        self.shared.approx_len.store(count, Ordering::Relaxed);

        if state.push_waiters > 0 {
            self.shared.writable.notify_one();
        }

        state
            .watermark
            .as_mut()
            .and_then(|w| w.crossed_down(count).then(|| Arc::clone(&w.handler)))
    }
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T> fmt::Debug for EventQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("id", &self.shared.id)
            .field("len", &self.len_relaxed())
            .finish_non_exhaustive()
    }
}

/// What a suspended operation does after releasing the lock.
enum Next<T> {
    Follow(EventQueue<T>),
    Wait,
}

#[derive(Clone, Copy)]
enum Side {
    Pop,
    Push,
}

/// Registration of a suspended caller. Dropping it (wake-up, timeout or
/// cancellation) withdraws the caller from the waiter count.
struct Waiter<'a, T> {
    shared: &'a Shared<T>,
    side: Side,
}

impl<'a, T> Waiter<'a, T> {
    fn new(shared: &'a Shared<T>, side: Side) -> Self {
        Self { shared, side }
    }
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        match self.side {
            Side::Pop => state.pop_waiters = state.pop_waiters.saturating_sub(1),
            Side::Push => state.push_waiters = state.push_waiters.saturating_sub(1),
        }
    }
}
