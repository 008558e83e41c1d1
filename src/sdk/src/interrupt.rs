//! MSI interrupt allocation and delivery.
//!
//! The kernel exposes a fixed pool of message-signalled vectors and one
//! blocking `waitinterrupt` call that returns whichever vector fired. The
//! registry below demultiplexes: the first line that blocks becomes the
//! harvester and routes foreign wake-ups to their lines through futex
//! words, then hands the harvesting role back.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use core::time::Duration;

use crate::{futex_wait, futex_wake, wait_interrupt};

/// Message address and data to program into a device's MSI-X entry.
#[derive(Debug, Clone, Copy)]
pub struct InterruptMessage {
    pub addr: u64,
    pub data: u32,
}

/// MSI message address targeting CPU 0 with fixed delivery.
const MSI_ADDRESS: u64 = 0xFEE0 << 20;

/// The kernel's first device vector; allocation indices are relative to
/// it.
const FIRST_VECTOR: u32 = 0x23;

/// Size of the kernel's device vector pool.
pub const MAX_LINES: usize = 10;

struct Registry {
    allocated: AtomicUsize,
    harvesting: AtomicBool,
    pending: [AtomicU32; MAX_LINES],
}

#[allow(clippy::declare_interior_mutable_const)]
const PENDING_ZERO: AtomicU32 = AtomicU32::new(0);

static REGISTRY: Registry = Registry {
    allocated: AtomicUsize::new(0),
    harvesting: AtomicBool::new(false),
    pending: [PENDING_ZERO; MAX_LINES],
};

/// A handle on one allocated interrupt vector.
pub struct InterruptLine {
    index: usize,
}

/// Reserves the next MSI vector. Returns the message to program into the
/// device and the line to wait on, or None when the pool is exhausted.
pub fn alloc_interrupt() -> Option<(InterruptMessage, InterruptLine)> {
    let index = REGISTRY.allocated.fetch_add(1, Ordering::Relaxed);
    if index >= MAX_LINES {
        REGISTRY.allocated.fetch_sub(1, Ordering::Relaxed);
        return None;
    }
    Some((
        InterruptMessage {
            addr: MSI_ADDRESS,
            data: FIRST_VECTOR + index as u32,
        },
        InterruptLine { index },
    ))
}

impl InterruptLine {
    /// The index the kernel reports for this line.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Consumes a pending delivery if there is one.
    pub fn try_take(&self) -> bool {
        REGISTRY.pending[self.index].swap(0, Ordering::Acquire) != 0
    }

    /// Blocks until this line's interrupt has fired at least once since
    /// the last take.
    pub fn wait(&self) {
        let me = &REGISTRY.pending[self.index];
        loop {
            if me.swap(0, Ordering::Acquire) != 0 {
                return;
            }
            if REGISTRY
                .harvesting
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // We are the harvester: take one delivery and route it.
                let fired = wait_interrupt();
                REGISTRY.harvesting.store(false, Ordering::Release);
                if let Ok(index) = fired {
                    if index < MAX_LINES {
                        let line = &REGISTRY.pending[index];
                        line.store(1, Ordering::Release);
                        if index != self.index {
                            futex_wake(line, 1);
                        }
                    }
                }
            } else {
                // Someone else harvests; park briefly. The timeout covers
                // the window where the wake raced our park.
                futex_wait(me, 0, Some(Duration::from_millis(10)));
            }
        }
    }
}
