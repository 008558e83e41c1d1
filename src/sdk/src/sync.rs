//! Futex-backed synchronization for the hosted runtime.

use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;

use crossbeam_queue::ArrayQueue;

use crate::{futex_wait, futex_wake};

/// How long blocked waiters park between re-checks. The kernel's futex
/// wait does not revalidate the word before parking, so a bounded park
/// turns a lost wake into a short stall instead of a hang.
const PARK: Duration = Duration::from_millis(20);

/// A one-shot-per-wait event flag.
pub struct Flag {
    word: AtomicU32,
}

impl Flag {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    /// Raises the flag and wakes one waiter.
    pub fn set(&self) {
        self.word.store(1, Ordering::Release);
        futex_wake(&self.word, 1);
    }

    /// Consumes the flag if raised.
    pub fn try_take(&self) -> bool {
        self.word.swap(0, Ordering::Acquire) != 0
    }

    /// Blocks until the flag is raised, then consumes it.
    pub fn wait(&self) {
        loop {
            if self.try_take() {
                return;
            }
            futex_wait(&self.word, 0, Some(PARK));
        }
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

/// A bounded single-producer single-consumer queue with blocking receive.
///
/// The intended shape: a device-reader thread produces, the main loop
/// consumes.
pub struct EventQueue<T> {
    queue: ArrayQueue<T>,
    available: Flag,
}

impl<T> EventQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            available: Flag::new(),
        }
    }

    /// Enqueues an event; returns it back if the queue is full.
    pub fn send(&self, value: T) -> Result<(), T> {
        self.queue.push(value)?;
        self.available.set();
        Ok(())
    }

    /// Dequeues an event without blocking.
    pub fn try_recv(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Blocks until an event arrives.
    pub fn recv(&self) -> T {
        loop {
            if let Some(v) = self.queue.pop() {
                return v;
            }
            self.available.wait();
        }
    }
}
