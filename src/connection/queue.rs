//! Work Queue
//!
//! Unbounded MPMC FIFO shared by every caller and every worker, plus the
//! monitor idle workers sleep on.
//!
//! Producers push and then notify one waiter while holding the monitor lock;
//! waiters re-check emptiness under the same lock before sleeping, so a push
//! can never slip between a worker's check and its wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};

/// Shared FIFO of pending work with a wait/notify signal
pub struct WorkQueue<T> {
    items: SegQueue<T>,
    monitor: Mutex<()>,
    available: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            items: SegQueue::new(),
            monitor: Mutex::new(()),
            available: Condvar::new(),
        }
    }

    /// Enqueue an item and wake one idle worker
    pub fn push(&self, item: T) {
        self.items.push(item);
        let _monitor = self.monitor.lock();
        self.available.notify_one();
    }

    /// Dequeue without blocking
    pub fn try_pop(&self) -> Option<T> {
        self.items.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Sleep until notified or until `timeout` elapses.
    ///
    /// Returns `false` only when the full timeout passed without a
    /// notification. Returns `true` right away if there is already work or
    /// `cancelled` is set.
    pub fn wait(&self, timeout: Duration, cancelled: &AtomicBool) -> bool {
        let mut monitor = self.monitor.lock();
        if !self.items.is_empty() || cancelled.load(Ordering::SeqCst) {
            return true;
        }
        !self.available.wait_for(&mut monitor, timeout).timed_out()
    }

    /// Wake every idle worker
    pub fn notify_all(&self) {
        let _monitor = self.monitor.lock();
        self.available.notify_all();
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
