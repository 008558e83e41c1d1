//! The vDSO page.
//!
//! Without a full vDSO image in the auxiliary vector, the hosted runtime
//! falls back to calling `gettimeofday` at a fixed address. That page gets
//! a 13-byte stub: `movabs r11, imm64; jmp r11`, landing in the kernel's
//! seqlock reader below. The reader is ordinary code and runs fine from
//! user mode since the address space is shared.

use crate::clock;
use crate::error::KernelError;
use crate::mem;

/// A Linux timeval as `gettimeofday` fills it in.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Timeval {
    pub seconds: i64,
    pub micros: i64,
}

/// Maps the vDSO page and writes the trampoline into it.
pub fn init() -> Result<(), KernelError> {
    if !mem::user_mmap_fixed(mem::VDSO_ADDRESS, mem::PAGE_SIZE as u64) {
        return Err(KernelError::AddressInUse);
    }
    let page = mem::VDSO_ADDRESS as *mut u8;
    // SAFETY: the page was just reserved; the first store faults it in.
    unsafe {
        // MOVABS R11, vdso_gettimeofday
        page.write(0x49);
        page.add(1).write(0xBB);
        (page.add(2) as *mut u64).write_unaligned(vdso_gettimeofday as usize as u64);
        // JMP R11
        page.add(10).write(0x41);
        page.add(11).write(0xFF);
        page.add(12).write(0xE3);
    }
    Ok(())
}

/// The `gettimeofday` implementation behind the stub. Lock-free: retries
/// while the clock's sequence number is odd or moves.
#[no_mangle]
pub extern "C" fn vdso_gettimeofday(tv: *mut Timeval, _tz: *mut u8) -> i64 {
    if !tv.is_null() {
        let t = clock::CLOCK.wall();
        // SAFETY: the caller handed us the pointer to fill.
        unsafe {
            tv.write(Timeval {
                seconds: t.seconds,
                micros: (t.nanos / 1_000) as i64,
            });
        }
    }
    0
}
