//! The system-call surface.
//!
//! The table is deliberately shaped for one managed runtime and is closed:
//! anything outside it returns ENOTSUP rather than silently succeeding,
//! except for the no-op set (signals, uname, epoll bookkeeping, pipe2) the
//! runtime insists on calling.
//!
//! Register convention is Linux amd64: number in RAX, arguments in RDI,
//! RSI, RDX, R10, R8, R9, primary return in RAX. The custom calls starting
//! at 0x8000_0000 add a secondary return in RDX.

use core::time::Duration;

use x86_64::instructions::port::Port;
use x86_64::registers::model_specific::{Efer, EferFlags, FsBase, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

use crate::arch::x86_64::serial;
use crate::arch::x86_64::{gdt, trampolines};
use crate::mem;
use crate::thread::{self, BlockState, Thread, WaitConditions};
use crate::KernelError;

// Linux syscall numbers.
const SYS_WRITE: u64 = 1;
const SYS_MMAP: u64 = 9;
const SYS_RT_SIGACTION: u64 = 13;
const SYS_RT_SIGPROCMASK: u64 = 14;
const SYS_NANOSLEEP: u64 = 35;
const SYS_CLONE: u64 = 56;
const SYS_UNAME: u64 = 63;
const SYS_SIGALTSTACK: u64 = 131;
const SYS_ARCH_PRCTL: u64 = 158;
const SYS_FUTEX: u64 = 202;
const SYS_EXIT_GROUP: u64 = 231;
const SYS_EPOLL_CTL: u64 = 233;
const SYS_EPOLL_PWAIT: u64 = 281;
const SYS_EPOLL_CREATE1: u64 = 291;
const SYS_PIPE2: u64 = 293;

// Custom device-access calls.
pub const SYS_OUTL: u64 = 0x8000_0000;
pub const SYS_INL: u64 = 0x8000_0001;
pub const SYS_IOMAP: u64 = 0x8000_0002;
pub const SYS_ALLOC: u64 = 0x8000_0003;
pub const SYS_WAITINTERRUPT: u64 = 0x8000_0004;

const ARCH_SET_FS: u64 = 0x1002;

const MAP_ANONYMOUS: u64 = 0x20;
const MAP_PRIVATE: u64 = 0x2;
const MAP_FIXED: u64 = 0x10;

const CLONE_VM: u64 = 0x100;
const CLONE_FS: u64 = 0x200;
const CLONE_FILES: u64 = 0x400;
const CLONE_SIGHAND: u64 = 0x800;
const CLONE_THREAD: u64 = 0x10000;
const CLONE_SYSVSEM: u64 = 0x40000;

/// The exact "new thread" flag combination accepted by `clone`.
const CLONE_THREAD_FLAGS: u64 =
    CLONE_VM | CLONE_FS | CLONE_FILES | CLONE_SIGHAND | CLONE_SYSVSEM | CLONE_THREAD;

const FUTEX_WAIT: u64 = 0;
const FUTEX_WAKE: u64 = 1;
const FUTEX_PRIVATE_FLAG: u64 = 128;
const FUTEX_WAIT_PRIVATE: u64 = FUTEX_WAIT | FUTEX_PRIVATE_FLAG;
const FUTEX_WAKE_PRIVATE: u64 = FUTEX_WAKE | FUTEX_PRIVATE_FLAG;

/// Errno encoding: `~errno + 1`, negative when reinterpreted as signed.
const fn errno(n: u64) -> u64 {
    !n + 1
}

pub const EOK: u64 = 0;
pub const ENOTSUP: u64 = errno(95);
pub const ENOMEM: u64 = errno(12);
pub const EINVAL: u64 = errno(22);

/// Processor flags for freshly built user contexts.
pub const FLAG_RESERVED: u64 = 1 << 1;
pub const FLAG_IF: u64 = 1 << 9;

/// A Linux timespec.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Timespec {
    pub seconds: i64,
    pub nanos: i64,
}

impl Timespec {
    /// Converts a user-supplied pointer into a duration; None for a null
    /// pointer or negative seconds.
    fn duration_from_user(ptr: u64) -> Option<Duration> {
        if ptr == 0 {
            return None;
        }
        // SAFETY: the runtime shares the address space; a bad pointer here
        // faults like any other user access.
        let ts = unsafe { core::ptr::read(ptr as *const Timespec) };
        if ts.seconds < 0 {
            return None;
        }
        Some(Duration::new(ts.seconds as u64, ts.nanos as u32))
    }
}

/// Programs the SYSCALL machinery: segment pair in STAR, entry point in
/// LSTAR, flag mask in FMASK, and the SCE enable bit.
pub fn init() {
    let sels = gdt::selectors();
    // SAFETY: the selector layout was built for exactly this call.
    unsafe {
        Star::write(sels.user_code64, sels.user_data, sels.code0, sels.data0)
            .unwrap_or_else(|_| crate::fatal("init_syscall: bad STAR selector layout"));
        // Interrupts stay off until the dispatcher has saved state.
        SFMask::write(
            RFlags::INTERRUPT_FLAG
                | RFlags::TRAP_FLAG
                | RFlags::ALIGNMENT_CHECK
                | RFlags::VIRTUAL_8086_MODE
                | RFlags::DIRECTION_FLAG,
        );
        LStar::write(VirtAddr::new(trampolines::syscall_trampoline as u64));
        Efer::update(|f| f.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
    }
}

/// SYSCALL dispatcher, entered from the trampoline with the caller's full
/// context saved in `t`. Resumes the thread directly when it stays
/// runnable, otherwise hands over to the scheduler. Never returns.
#[no_mangle]
extern "C" fn sysenter(t: &mut Thread) -> ! {
    t.block = BlockState {
        in_syscall: true,
        ..BlockState::runnable()
    };
    let sysno = t.ctx.ax;
    let args = [t.ctx.di, t.ctx.si, t.ctx.dx, t.ctx.r10, t.ctx.r8, t.ctx.r9];
    let (ret0, ret1) = dispatch(t, sysno, args);
    t.set_syscall_result(ret0, ret1);
    if t.block.conditions.is_empty() {
        // SAFETY: the context is complete; the fast path is valid because
        // the caller arrived through SYSCALL.
        unsafe { trampolines::resume_thread_fast() }
    }
    thread::schedule(t.id)
}

fn dispatch(t: &mut Thread, sysno: u64, args: [u64; 6]) -> (u64, u64) {
    let [a0, a1, a2, a3, _a4, _a5] = args;
    match sysno {
        SYS_WRITE => {
            let (fd, ptr, n) = (a0, a1, a2 as u32 as usize);
            // fd 0 is the runtime's throwaway descriptor: report the bytes
            // as written without looking at them.
            if fd == 0 {
                return (n as u64, 0);
            }
            if fd != 1 && fd != 2 {
                return (ENOTSUP, 0);
            }
            // SAFETY: shared address space; the pointer is the caller's
            // problem exactly as far as any of its own loads would be.
            let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, n) };
            serial::write_bytes(bytes);
            (bytes.len() as u64, 0)
        }
        SYS_MMAP => {
            let (addr, n, flags) = (a0, a1, a3);
            let supported = MAP_ANONYMOUS | MAP_PRIVATE | MAP_FIXED;
            if flags & !supported != 0 {
                return (ENOTSUP, 0);
            }
            // Protection bits are ignored; everything is mapped writable
            // and user-accessible.
            if flags & MAP_FIXED != 0 {
                // A failed fixed reservation means the range exists
                // already, which callers treat as success.
                let _ = mem::user_mmap_fixed(addr, n);
                (addr, 0)
            } else {
                match mem::user_mmap(addr, n) {
                    Ok(addr) => (addr, 0),
                    Err(_) => (ENOMEM, 0),
                }
            }
        }
        SYS_CLONE => {
            if a0 != CLONE_THREAD_FLAGS {
                return (ENOTSUP, 0);
            }
            let stack = a1;
            let clone = match thread::new_thread() {
                Ok(clone) => clone,
                Err(_) => return (ENOMEM, 0),
            };
            clone.ctx = t.ctx;
            clone.ctx.sp = stack;
            // The child observes return value 0.
            clone.ctx.ax = 0;
            (clone.id, 0)
        }
        SYS_EXIT_GROUP => {
            t.block.conditions = WaitConditions::DEAD;
            (EOK, 0)
        }
        SYS_ARCH_PRCTL => match a0 {
            ARCH_SET_FS => {
                t.ctx.fs_base = a1;
                FsBase::write(VirtAddr::new(a1));
                (EOK, 0)
            }
            _ => (ENOTSUP, 0),
        },
        // The runtime only consults uname to detect buggy kernel versions.
        SYS_UNAME => (EOK, 0),
        SYS_FUTEX => {
            let (addr, op, val) = (a0, a1, a2);
            match op {
                FUTEX_WAIT | FUTEX_WAIT_PRIVATE => {
                    if let Some(d) = Timespec::duration_from_user(a3) {
                        t.sleep_for(d);
                    }
                    t.block.conditions |= WaitConditions::FUTEX;
                    t.block.futex = addr;
                    (0, 0)
                }
                FUTEX_WAKE | FUTEX_WAKE_PRIVATE => {
                    thread::futex_wake(addr, val as usize);
                    (EOK, 0)
                }
                _ => (ENOTSUP, 0),
            }
        }
        // Signals do not exist here; accept and ignore.
        SYS_RT_SIGACTION | SYS_RT_SIGPROCMASK | SYS_SIGALTSTACK => (EOK, 0),
        SYS_NANOSLEEP => {
            if let Some(d) = Timespec::duration_from_user(a0) {
                t.sleep_for(d);
            }
            (EOK, 0)
        }
        SYS_EPOLL_CREATE1 | SYS_EPOLL_CTL | SYS_PIPE2 => (EOK, 0),
        SYS_EPOLL_PWAIT => {
            let timeout_ms = a3 as i64;
            if timeout_ms >= 0 {
                t.sleep_for(Duration::from_millis(timeout_ms as u64));
            } else {
                // An unbounded epoll wait has no wake source in this
                // kernel; the thread is parked for good.
                t.block.conditions = WaitConditions::DEAD;
            }
            (EOK, 0)
        }
        SYS_OUTL => {
            // SAFETY: direct device access is the point of this call; the
            // hosted runtime owns the machine.
            unsafe { Port::new(a0 as u16).write(a1 as u32) };
            (EOK, 0)
        }
        SYS_INL => {
            // SAFETY: as above.
            let val: u32 = unsafe { Port::new(a0 as u16).read() };
            (val as u64, 0)
        }
        SYS_IOMAP => match mem::iomap(a0, a1, a2) {
            Ok(()) => (EOK, 0),
            Err(KernelError::InvalidArgument) => (EINVAL, 0),
            Err(_) => (ENOMEM, 0),
        },
        SYS_ALLOC => match mem::alloc_zeroed(a0 as usize) {
            Ok((addr, size)) => (addr, size as u64),
            Err(_) => (ENOMEM, 0),
        },
        SYS_WAITINTERRUPT => {
            // The wake path deposits the vector index in the secondary
            // return register.
            t.block.conditions = WaitConditions::INTERRUPT;
            (0, 0)
        }
        _ => (ENOTSUP, 0),
    }
}
