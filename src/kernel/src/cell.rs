//! Interior mutability for single-CPU kernel state.

use core::cell::UnsafeCell;

use x86_64::instructions::interrupts;

/// A cell for kernel singletons on a single logical CPU.
///
/// Access runs with interrupts disabled, which is the only mutual exclusion
/// this kernel needs: there is one CPU and interrupt handlers are the only
/// other execution context.
pub struct KernelCell<T> {
    inner: UnsafeCell<T>,
}

// SAFETY: single CPU; all access goes through `with`, which disables
// interrupts, or through `raw`, whose callers document why reentrancy is
// sound at that site.
unsafe impl<T> Sync for KernelCell<T> {}

impl<T> KernelCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: UnsafeCell::new(value),
        }
    }

    /// Runs `f` on the contained value with interrupts disabled.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        interrupts::without_interrupts(|| {
            // SAFETY: interrupts are off and there is a single CPU, so this
            // is the only live reference.
            f(unsafe { &mut *self.inner.get() })
        })
    }

    /// Raw pointer to the contained value.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no conflicting access. The page-fault path
    /// uses this: it may interrupt a `with` on the same cell, but only for
    /// reads that the interrupted writer keeps consistent.
    pub unsafe fn raw(&self) -> *mut T {
        self.inner.get()
    }
}
