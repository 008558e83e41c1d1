//! Threads and the cooperative scheduler.
//!
//! Threads live in a fixed-capacity table inside a demand-paged
//! reservation. Each entry holds the full CPU context (registers, flags,
//! FS base and the 512-byte FXSAVE area) plus a blocking condition. The
//! current thread is the one the GS base points at; the assembly
//! trampolines save and restore context through that pointer.
//!
//! Scheduling is round-robin over the runnable set, driven by traps:
//! a thread gives up the CPU only at a SYSCALL or at a trap, and the HPET
//! one-shot enforces the 10 ms slice.

use core::cell::UnsafeCell;
use core::mem::offset_of;
use core::time::Duration;

use bitflags::bitflags;
use x86_64::registers::model_specific::{FsBase, GsBase};
use x86_64::VirtAddr;

use crate::arch::x86_64::interrupts;
use crate::arch::x86_64::trampolines::{resume_thread, resume_thread_fast};
use crate::cell::KernelCell;
use crate::error::KernelError;
use crate::mem;
use crate::{clock, serial_print, serial_println};

/// Capacity of the thread table.
pub const MAX_THREADS: usize = 100;

/// Scheduler time slice.
pub const TIME_SLICE: Duration = Duration::from_millis(10);

pub type Tid = u64;

bitflags! {
    /// Conditions that keep a thread off the runnable set. Empty means
    /// runnable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitConditions: u32 {
        /// Waiting for any device interrupt.
        const INTERRUPT = 1 << 0;
        /// Waiting for a deadline.
        const SLEEP = 1 << 1;
        /// Waiting on a futex word; cleared only by a wake (or the
        /// optional SLEEP deadline).
        const FUTEX = 1 << 2;
        /// Terminal.
        const DEAD = 1 << 3;
    }
}

/// Why a thread is blocked, and how to resume it.
#[derive(Debug, Clone, Copy)]
pub struct BlockState {
    /// Set when the thread entered the kernel through SYSCALL; selects the
    /// fast resume path (RCX/R11 clobbered, FPU untouched).
    pub in_syscall: bool,
    pub conditions: WaitConditions,
    /// Monotonic milliseconds when the sleep started.
    pub sleep_start_ms: u64,
    pub sleep_duration: Duration,
    /// Futex word address for FUTEX waits.
    pub futex: u64,
}

impl BlockState {
    pub const fn runnable() -> Self {
        Self {
            in_syscall: false,
            conditions: WaitConditions::empty(),
            sleep_start_ms: 0,
            sleep_duration: Duration::ZERO,
            futex: 0,
        }
    }
}

/// A thread's CPU context. The assembly in `trampolines.rs` hardcodes this
/// layout; the assertions below pin it.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub ip: u64,
    pub sp: u64,
    pub flags: u64,
    pub bp: u64,
    pub ax: u64,
    pub bx: u64,
    pub cx: u64,
    pub dx: u64,
    pub si: u64,
    pub di: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub fs_base: u64,
    /// FXSAVE/FXRSTOR area; must be 16-byte aligned.
    pub fp_state: [u8; 512],
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            ip: 0,
            sp: 0,
            flags: 0,
            bp: 0,
            ax: 0,
            bx: 0,
            cx: 0,
            dx: 0,
            si: 0,
            di: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            fs_base: 0,
            fp_state: [0; 512],
        }
    }
}

/// Per-thread state. The self pointer at offset 0 lets assembly find the
/// structure through `gs:[0]`.
#[repr(C, align(16))]
pub struct Thread {
    self_ptr: *mut Thread,
    pub ctx: Context,
    pub id: Tid,
    pub block: BlockState,
}

// The trampoline offsets, pinned at compile time.
const _: () = {
    assert!(offset_of!(Thread, self_ptr) == 0x00);
    assert!(offset_of!(Thread, ctx) == 0x08);
    assert!(offset_of!(Thread, ctx) + offset_of!(Context, ip) == 0x08);
    assert!(offset_of!(Thread, ctx) + offset_of!(Context, sp) == 0x10);
    assert!(offset_of!(Thread, ctx) + offset_of!(Context, flags) == 0x18);
    assert!(offset_of!(Thread, ctx) + offset_of!(Context, bp) == 0x20);
    assert!(offset_of!(Thread, ctx) + offset_of!(Context, ax) == 0x28);
    assert!(offset_of!(Thread, ctx) + offset_of!(Context, bx) == 0x30);
    assert!(offset_of!(Thread, ctx) + offset_of!(Context, cx) == 0x38);
    assert!(offset_of!(Thread, ctx) + offset_of!(Context, dx) == 0x40);
    assert!(offset_of!(Thread, ctx) + offset_of!(Context, si) == 0x48);
    assert!(offset_of!(Thread, ctx) + offset_of!(Context, di) == 0x50);
    assert!(offset_of!(Thread, ctx) + offset_of!(Context, r8) == 0x58);
    assert!(offset_of!(Thread, ctx) + offset_of!(Context, r15) == 0x90);
    assert!(offset_of!(Thread, ctx) + offset_of!(Context, fs_base) == 0x98);
    assert!(offset_of!(Thread, ctx) + offset_of!(Context, fp_state) == 0xA0);
    assert!((offset_of!(Thread, ctx) + offset_of!(Context, fp_state)) % 16 == 0);
};

impl Thread {
    const fn new(id: Tid) -> Self {
        Self {
            self_ptr: core::ptr::null_mut(),
            ctx: Context::zeroed(),
            id,
            block: BlockState::runnable(),
        }
    }

    /// Writes the syscall return values into the saved context (RAX and
    /// RDX, the primary and secondary return registers).
    pub fn set_syscall_result(&mut self, ret0: u64, ret1: u64) {
        self.ctx.ax = ret0;
        self.ctx.dx = ret1;
    }

    /// Installs a sleep deadline `duration` from now.
    pub fn sleep_for(&mut self, duration: Duration) {
        self.block.conditions |= WaitConditions::SLEEP;
        self.block.sleep_start_ms = clock::CLOCK.monotone_millis();
        self.block.sleep_duration = duration;
    }

    /// Decides whether the thread can run at monotonic time `now_ms`.
    /// For blocked threads, returns the remaining sleep if there is one,
    /// so the scheduler can bound its idle period.
    fn runnable(&mut self, now_ms: u64) -> (Option<Duration>, bool) {
        let cond = self.block.conditions;
        if cond.is_empty() {
            return (None, true);
        }
        if cond.contains(WaitConditions::INTERRUPT) {
            if let Some(index) = interrupts::take_pending() {
                self.set_syscall_result(0, index as u64);
                return (None, true);
            }
        }
        if cond.contains(WaitConditions::SLEEP) {
            let elapsed = Duration::from_millis(now_ms.saturating_sub(self.block.sleep_start_ms));
            return match self.block.sleep_duration.checked_sub(elapsed) {
                Some(rem) if !rem.is_zero() => (Some(rem), false),
                _ => (None, true),
            };
        }
        (None, false)
    }
}

struct ThreadTable {
    ptr: *mut Thread,
    len: usize,
}

// SAFETY: accessed only through the kernel cell that owns it.
unsafe impl Send for ThreadTable {}

static THREADS: KernelCell<ThreadTable> = KernelCell::new(ThreadTable {
    ptr: core::ptr::null_mut(),
    len: 0,
});

struct StaticThread(UnsafeCell<Thread>);

// SAFETY: single CPU; these are only touched at boot and from the
// scheduler with interrupts disabled.
unsafe impl Sync for StaticThread {}

/// Thread context used during early boot, before the table exists, so the
/// trampolines always have somewhere to save state.
static BOOT_THREAD: StaticThread = StaticThread(UnsafeCell::new(Thread::new(0)));

/// Placeholder context the scheduler parks the GS base on while idling, so
/// a timer trap during HLT does not scribble over a real thread.
static KERNEL_THREAD: StaticThread = StaticThread(UnsafeCell::new(Thread::new(0)));

/// Makes `t` the current thread: GS points at the structure and the
/// thread's FS base becomes live.
pub fn make_current(t: *mut Thread) {
    // SAFETY: t points at a live thread structure.
    unsafe {
        (*t).self_ptr = t;
        GsBase::write(VirtAddr::new(t as u64));
        FsBase::write(VirtAddr::new((*t).ctx.fs_base));
    }
}

/// The thread the GS base designates.
pub fn current_thread() -> *mut Thread {
    let t: *mut Thread;
    // SAFETY: GS base always points at a thread structure once
    // init_boot_thread has run.
    unsafe {
        core::arch::asm!("mov {}, gs:[0]", out(reg) t, options(nostack, preserves_flags));
    }
    t
}

/// Parks the GS base on the boot context. Must run before the first trap
/// can possibly fire.
pub fn init_boot_thread() {
    make_current(BOOT_THREAD.0.get());
}

/// Reserves the thread table inside a demand-paged range.
pub fn init() -> Result<(), KernelError> {
    use x86_64::structures::paging::PageTableFlags;
    let size = core::mem::size_of::<Thread>() * MAX_THREADS;
    let addr = mem::vmap_reserve(
        0,
        size as u64,
        PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
    )?;
    THREADS.with(|t| {
        t.ptr = addr as *mut Thread;
        t.len = 0;
    });
    Ok(())
}

/// Allocates a fresh runnable thread and returns it.
pub fn new_thread() -> Result<&'static mut Thread, KernelError> {
    THREADS.with(|table| {
        if table.len == MAX_THREADS {
            return Err(KernelError::TooManyThreads);
        }
        let id = table.len as Tid;
        // SAFETY: the slot is inside the table reservation; writing it
        // faults the backing page in.
        let slot = unsafe { table.ptr.add(table.len) };
        unsafe { slot.write(Thread::new(id)) };
        table.len += 1;
        // SAFETY: the table lives for the kernel's lifetime.
        Ok(unsafe { &mut *slot })
    })
}

/// Wakes up to `nwaiters` threads blocked on the futex word at `addr`.
/// Waking is advisory; woken threads re-check the word in user space.
pub fn futex_wake(addr: u64, nwaiters: usize) {
    THREADS.with(|table| {
        let mut remaining = nwaiters;
        for i in 0..table.len {
            if remaining == 0 {
                break;
            }
            // SAFETY: entries 0..len are initialized.
            let t = unsafe { &mut *table.ptr.add(i) };
            if !t.block.conditions.contains(WaitConditions::FUTEX) {
                continue;
            }
            if t.block.futex != addr {
                continue;
            }
            t.block.conditions = WaitConditions::empty();
            remaining -= 1;
        }
    });
}

/// Selects the next runnable thread and resumes it; idles with the CPU
/// halted when there is none. Runs with interrupts disabled on the kernel
/// stack and never returns.
pub fn schedule(prev: Tid) -> ! {
    let mut prev = prev as usize;
    loop {
        clock::update_clock();
        let now = clock::CLOCK.monotone_millis();
        let mut next_wake = Duration::from_secs(24 * 3600);
        let (base, len) = THREADS.with(|t| (t.ptr, t.len));
        let mut chosen: Option<*mut Thread> = None;
        for step in 0..len {
            let idx = (prev + 1 + step) % len;
            // SAFETY: entries 0..len are initialized and nothing else runs.
            let t = unsafe { &mut *base.add(idx) };
            match t.runnable(now) {
                (_, true) => {
                    chosen = Some(t);
                    break;
                }
                (Some(rem), false) => next_wake = next_wake.min(rem),
                (None, false) => {}
            }
        }
        match chosen {
            Some(t) => {
                // SAFETY: t came from the live table.
                let t = unsafe { &mut *t };
                let fast = t.block.in_syscall;
                t.block.conditions = WaitConditions::empty();
                make_current(t);
                clock::set_timer(TIME_SLICE.min(next_wake));
                // SAFETY: the thread's context is a complete snapshot taken
                // at its last suspension point.
                unsafe {
                    if fast {
                        resume_thread_fast()
                    } else {
                        resume_thread()
                    }
                }
            }
            None => {
                prev = if len == 0 { 0 } else { (prev + len) % len };
                clock::set_timer(next_wake);
                idle();
            }
        }
    }
}

/// Halts until an interrupt arrives. The GS base is parked on a throwaway
/// context first: a timer trap taken here saves into it and re-enters the
/// scheduler, while device interrupts return into the loop above.
fn idle() {
    make_current(KERNEL_THREAD.0.get());
    // SAFETY: enables interrupts only for the duration of one HLT.
    unsafe { crate::arch::x86_64::trampolines::yield_halt() };
}

/// Entry from the timer trap: the interrupted context is already saved in
/// the current thread, which goes back into the runnable pool.
pub fn interrupt_schedule() -> ! {
    // SAFETY: GS points at the interrupted thread; the trampoline saved
    // its full context there.
    let t = unsafe { &mut *current_thread() };
    t.block = BlockState::runnable();
    schedule(t.id)
}

/// Dumps the current thread's registers and the head of its FPU save area
/// to the serial console. Best effort; used by the fatal path.
pub fn dump_current() {
    let t = {
        let ptr = GsBase::read().as_u64();
        if ptr == 0 || ptr % core::mem::align_of::<Thread>() as u64 != 0 {
            return;
        }
        // SAFETY: a non-null aligned GS base always designates a thread in
        // this kernel.
        unsafe { &*(ptr as *const Thread) }
    };
    let c = &t.ctx;
    let fields: [(&str, u64); 20] = [
        ("addr", t as *const Thread as u64),
        ("id", t.id),
        ("ip", c.ip),
        ("sp", c.sp),
        ("flags", c.flags),
        ("bp", c.bp),
        ("ax", c.ax),
        ("bx", c.bx),
        ("cx", c.cx),
        ("dx", c.dx),
        ("si", c.si),
        ("di", c.di),
        ("r8", c.r8),
        ("r9", c.r9),
        ("r10", c.r10),
        ("r11", c.r11),
        ("r12", c.r12),
        ("r13", c.r13),
        ("r14", c.r14),
        ("r15", c.r15),
    ];
    for (name, value) in fields {
        serial_print!("{}: {:#x} ", name, value);
    }
    serial_print!("fsbase: {:#x} ", c.fs_base);
    for (i, chunk) in c.fp_state.chunks_exact(8).take(8).enumerate() {
        let v = u64::from_le_bytes(chunk.try_into().unwrap());
        serial_print!("f{}: {:#x} ", i, v);
    }
    serial_println!();
}
