//! Ydin kernel
//!
//! A minimal x86-64 unikernel. It boots from a small UEFI loader, takes over
//! a single processor and hosts one Linux-ABI runtime that shares the kernel
//! address space. There is no isolation between the kernel and the hosted
//! runtime and no SMP; the design trades generality for a small, auditable
//! core.
//!
//! # Architecture
//!
//! - `arch`: platform code (CPU primitives, serial, GDT/TSS, traps, APIC)
//! - `mem`: physical frame bitmap, 4-level page tables, virtual range map
//!   and demand paging
//! - `clock`: HPET monotonic clock, CMOS wall time, seqlock publication
//! - `thread`: thread table, blocking conditions, round-robin scheduler
//! - `syscall`: the Linux-ABI subset consumed by the hosted runtime
//! - `vdso`: the user-visible `gettimeofday` trampoline page
//!
//! # Safety
//!
//! This is a `#![no_std]` kernel for a single logical CPU. Kernel data
//! structures are mutated with interrupts disabled; unsafe code documents
//! the invariant it relies on.

#![no_std]

extern crate alloc;

pub mod allocator;
pub mod arch;
pub mod boot;
pub mod cell;
pub mod clock;
pub mod error;
pub mod mem;
pub mod syscall;
pub mod testutil;
pub mod thread;
pub mod vdso;

pub mod tests;

pub use error::KernelError;

/// Initializes the early console.
///
/// Called before anything that may log. Memory and trap setup happen in the
/// boot path proper because they need the firmware-provided memory map.
pub fn init() {
    #[cfg(target_arch = "x86_64")]
    arch::x86_64::serial::init();
}

/// Prints a single diagnostic line and halts the processor forever.
///
/// Used for unrecoverable kernel states: the machine is left running so the
/// serial output stays readable under an emulator.
pub fn fatal(site: &str) -> ! {
    arch::x86_64::serial::force_unlock();
    serial_println!("fatal error: {}", site);
    thread::dump_current();
    arch::x86_64::halt_loop();
}

/// Like [`fatal`] but for a propagated [`KernelError`].
pub fn fatal_error(site: &str, err: KernelError) -> ! {
    arch::x86_64::serial::force_unlock();
    serial_println!("fatal error: {}: {}", site, err);
    thread::dump_current();
    arch::x86_64::halt_loop();
}
