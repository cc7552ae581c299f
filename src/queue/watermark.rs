//! High/low watermark bookkeeping.
//!
//! The high callback fires each time the depth lands on a positive multiple
//! of `high` on the way up. The low callback fires when the depth comes back
//! down to `n * high + low` while a matching high crossing is still
//! unacknowledged, so bursts larger than `high` pair up correctly.

use std::sync::Arc;

use super::fifo::EventQueue;

/// Receiver of watermark crossings.
///
/// Callbacks run on the task that caused the crossing, with the queue lock
/// released. They may call the non-blocking queue operations (`len`,
/// `try_pop`, `stats`) on the same queue.
pub trait WatermarkHandler<T>: Send + Sync {
    /// Depth reached a multiple of the high threshold.
    fn on_high(&self, queue: &EventQueue<T>);

    /// Depth fell back through the low threshold of an acknowledged crossing.
    fn on_low(&self, queue: &EventQueue<T>);
}

pub(crate) struct Watermark<T> {
    pub(crate) high: usize,
    pub(crate) low: usize,
    pub(crate) handler: Arc<dyn WatermarkHandler<T>>,
    /// Depth at the last high crossing not yet matched by a low one.
    pub(crate) highest: usize,
}

impl<T> Watermark<T> {
    pub(crate) fn new(high: usize, low: usize, handler: Arc<dyn WatermarkHandler<T>>) -> Self {
        Self {
            high,
            low,
            handler,
            highest: 0,
        }
    }

    /// Account for a push that left `count` items queued.
    pub(crate) fn crossed_up(&mut self, count: usize) -> bool {
        if count > 0 && count % self.high == 0 {
            self.highest = count;
            return true;
        }
        false
    }

    /// Account for a pop that left `count` items queued.
    pub(crate) fn crossed_down(&mut self, count: usize) -> bool {
        if count % self.high == self.low && self.highest > count {
            self.highest -= self.high;
            return true;
        }
        false
    }

    /// Account for items spliced in by a move; reports at most one crossing.
    pub(crate) fn absorbed(&mut self, count: usize) -> bool {
        let level = count - count % self.high;
        if level > self.highest {
            self.highest = level;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl WatermarkHandler<u32> for Nop {
        fn on_high(&self, _queue: &EventQueue<u32>) {}
        fn on_low(&self, _queue: &EventQueue<u32>) {}
    }

    fn mark(high: usize, low: usize) -> Watermark<u32> {
        Watermark::new(high, low, Arc::new(Nop))
    }

    #[test]
    fn fires_on_every_multiple_going_up() {
        let mut w = mark(3, 1);
        let fired: Vec<usize> = (1..=9).filter(|&c| w.crossed_up(c)).collect();
        assert_eq!(fired, vec![3, 6, 9]);
        assert_eq!(w.highest, 9);
    }

    #[test]
    fn low_pairs_with_each_acknowledged_high() {
        let mut w = mark(2, 1);
        for c in 1..=6 {
            w.crossed_up(c);
        }
        let fired: Vec<usize> = (0..6).rev().filter(|&c| w.crossed_down(c)).collect();
        assert_eq!(fired, vec![5, 3, 1]);
        assert_eq!(w.highest, 0);
    }

    #[test]
    fn low_without_prior_high_is_silent() {
        let mut w = mark(10, 5);
        for c in 1..=7 {
            assert!(!w.crossed_up(c));
        }
        assert!(!w.crossed_down(5));
    }

    #[test]
    fn zero_low_fires_when_drained() {
        let mut w = mark(4, 0);
        for c in 1..=4 {
            w.crossed_up(c);
        }
        assert!(!w.crossed_down(3));
        assert!(w.crossed_down(0));
    }

    #[test]
    fn splice_reports_one_crossing() {
        let mut w = mark(4, 1);
        assert!(w.absorbed(9));
        assert_eq!(w.highest, 8);
        assert!(!w.absorbed(11));
    }
}
