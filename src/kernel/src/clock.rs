//! Wall and monotonic time.
//!
//! The HPET provides the monotonic tick: a femtosecond-scaled counter with
//! one comparator programmed as a one-shot FSB (MSI) timer. Wall time is
//! seeded once from the CMOS RTC at boot and advanced together with the
//! monotonic clock.
//!
//! Published time is a seqlock triple `(seq, wall, mono)` with a single
//! writer (the kernel, interrupts disabled) and lock-free readers, the vDSO
//! `gettimeofday` path among them.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

use x86_64::instructions::port::Port;
use x86_64::structures::paging::PageTableFlags;

use crate::arch::x86_64::interrupts::{INT_TIMER, MSI_MESSAGE_ADDRESS};
use crate::cell::KernelCell;
use crate::error::KernelError;
use crate::mem;

/// Fixed MMIO address of the HPET block.
const HPET_BASE: u64 = 0xFED0_0000;

const TN_FSB_INT_DEL_CAP: u64 = 1 << 15;
const TN_FSB_EN_CNF: u64 = 1 << 14;
const TN_INT_ENB_CNF: u64 = 1 << 2;
const TN_32MODE_CNF: u64 = 1 << 8;
const ENABLE_CNF: u64 = 1 << 0;

/// Hardware register layout of the HPET block (IA-PC HPET specification).
#[repr(C)]
struct HpetRegs {
    cap_id: u64,
    _r0: u64,
    conf: u64,
    _r1: u64,
    status: u64,
    _r2: [u64; 25],
    counter: u64,
    _r3: u64,
    timers: [HpetTimerRegs; 32],
}

#[repr(C)]
struct HpetTimerRegs {
    conf_cap: u64,
    comparator: u64,
    fsb: u64,
    _r: u64,
}

struct Hpet {
    regs: *mut HpetRegs,
    /// Counter period in femtoseconds.
    period: u32,
    /// Counter value at the last clock update.
    last: u32,
    /// Sub-nanosecond remainder in femtoseconds.
    accum: u64,
}

// SAFETY: accessed only through the kernel cell that owns it.
unsafe impl Send for Hpet {}

impl Hpet {
    fn read_counter(&self) -> u32 {
        // SAFETY: the register page is mapped uncached; the main counter is
        // 64 bits wide but runs in 32-bit mode.
        unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*self.regs).counter)) as u32 }
    }

    fn write_counter(&self, value: u32) {
        // SAFETY: as above; writes are only done with the HPET disabled.
        unsafe {
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*self.regs).counter), value as u64)
        }
    }

    fn oneshot(&self, comparator: u32) {
        // SAFETY: timer 0 exists (checked at init).
        unsafe {
            core::ptr::write_volatile(
                core::ptr::addr_of_mut!((*self.regs).timers[0].comparator),
                comparator as u64,
            )
        }
    }
}

static HPET: KernelCell<Option<Hpet>> = KernelCell::new(None);

/// A point in time as published to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Instant {
    pub seconds: i64,
    pub nanos: u32,
}

impl Instant {
    const fn zero() -> Self {
        Self {
            seconds: 0,
            nanos: 0,
        }
    }

    fn advance(&mut self, nanoseconds: u64) {
        let nanos = nanoseconds + self.nanos as u64;
        self.seconds += (nanos / 1_000_000_000) as i64;
        self.nanos = (nanos % 1_000_000_000) as u32;
    }
}

/// Seqlock-published clock: one writer, lock-free readers.
///
/// The sequence number is incremented before and after each write, so an
/// odd value marks a write in progress. Readers retry while the sequence
/// is odd or changes across their read.
pub struct Clock {
    seq: AtomicU64,
    wall: UnsafeCell<Instant>,
    mono: UnsafeCell<Instant>,
}

// SAFETY: writes happen on the single CPU with interrupts disabled and are
// bracketed by the sequence number; readers only ever retry.
unsafe impl Sync for Clock {}

impl Clock {
    const fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            wall: UnsafeCell::new(Instant::zero()),
            mono: UnsafeCell::new(Instant::zero()),
        }
    }

    fn seed_wall(&self, seconds: i64) {
        // Single-threaded boot; no reader exists yet.
        unsafe { (*self.wall.get()).seconds = seconds };
    }

    /// Advances both instants. Caller must be the single writer with
    /// interrupts disabled.
    fn advance(&self, nanoseconds: u64) {
        self.seq.fetch_add(1, Ordering::Release);
        // SAFETY: single writer; readers retry on odd or changed seq.
        unsafe {
            (*self.wall.get()).advance(nanoseconds);
            (*self.mono.get()).advance(nanoseconds);
        }
        self.seq.fetch_add(1, Ordering::Release);
    }

    fn read(&self, which: &UnsafeCell<Instant>) -> Instant {
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 % 2 != 0 {
                core::hint::spin_loop();
                continue;
            }
            // SAFETY: torn values are discarded by the sequence re-check.
            let value = unsafe { core::ptr::read_volatile(which.get()) };
            let s2 = self.seq.load(Ordering::Acquire);
            if s1 == s2 {
                return value;
            }
        }
    }

    /// Current wall time.
    pub fn wall(&self) -> Instant {
        self.read(&self.wall)
    }

    /// Current monotonic time.
    pub fn monotone(&self) -> Instant {
        self.read(&self.mono)
    }

    /// Monotonic time in whole milliseconds.
    pub fn monotone_millis(&self) -> u64 {
        let t = self.monotone();
        t.seconds as u64 * 1_000 + (t.nanos / 1_000_000) as u64
    }
}

/// The system clock.
pub static CLOCK: Clock = Clock::new();

/// Maps the HPET, validates its period and arms timer 0 for one-shot FSB
/// delivery to the timer vector. The wall clock is seeded from the CMOS
/// RTC first.
pub fn init() -> Result<(), KernelError> {
    CLOCK.seed_wall(read_cmos_time());

    let flags = PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE | PageTableFlags::NO_CACHE;
    mem::map_mmio(HPET_BASE, mem::PAGE_SIZE as u64, flags)?;
    let regs = HPET_BASE as *mut HpetRegs;

    // SAFETY: the register page was just mapped.
    let cap_id = unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*regs).cap_id)) };
    let period = (cap_id >> 32) as u32;
    // The specification caps the period at 100 ns.
    if period == 0 || period > 100_000_000 {
        return Err(KernelError::InvalidClockPeriod);
    }

    let hpet = Hpet {
        regs,
        period,
        last: 0,
        accum: 0,
    };

    // SAFETY: timer 0 always exists; QEMU's HPET omits the FSB capability
    // bit yet delivers FSB interrupts fine, so the capability is probed but
    // not required.
    unsafe {
        let t0 = core::ptr::addr_of_mut!((*regs).timers[0]);
        let _supports_fsb =
            core::ptr::read_volatile(core::ptr::addr_of!((*t0).conf_cap)) & TN_FSB_INT_DEL_CAP != 0;
        core::ptr::write_volatile(
            core::ptr::addr_of_mut!((*t0).fsb),
            (MSI_MESSAGE_ADDRESS << 32) | INT_TIMER as u64,
        );
        core::ptr::write_volatile(
            core::ptr::addr_of_mut!((*t0).conf_cap),
            TN_FSB_EN_CNF | TN_INT_ENB_CNF | TN_32MODE_CNF,
        );
        hpet.write_counter(0);
        let conf = core::ptr::read_volatile(core::ptr::addr_of!((*regs).conf));
        core::ptr::write_volatile(core::ptr::addr_of_mut!((*regs).conf), conf | ENABLE_CNF);
    }

    HPET.with(|h| *h = Some(hpet));
    Ok(())
}

/// Folds the HPET ticks since the last sample into the clock.
pub fn update_clock() {
    HPET.with(|h| {
        let hpet = h.as_mut().expect("clock not initialized");
        let counter = hpet.read_counter();
        advance_to(hpet, counter);
    });
}

fn advance_to(hpet: &mut Hpet, counter: u32) {
    // The subtraction is correct even if the counter wrapped once since the
    // last sample.
    let periods = counter.wrapping_sub(hpet.last) as u64;
    hpet.last = counter;
    let femtos = periods * hpet.period as u64;
    let acc = hpet.accum + femtos;
    hpet.accum = acc % 1_000_000;
    CLOCK.advance(acc / 1_000_000);
}

/// Arms the one-shot timer to fire after `dur`.
pub fn set_timer(dur: Duration) {
    // Cap the delay so the clock is updated before the 32-bit counter can
    // wrap and lose time.
    const MAX: Duration = Duration::from_secs(2);
    let dur = dur.min(MAX);
    HPET.with(|h| {
        let hpet = h.as_mut().expect("clock not initialized");
        let fs = dur.as_nanos() as u64 * 1_000_000;
        let schedule_periods = ((fs / hpet.period as u64).min(u32::MAX as u64) as u32).max(1);
        let mut counter = hpet.last;
        // The comparator matches on equality and the counter never stops,
        // so the deadline may slip past between computing and arming it.
        // Re-arm until the comparator is ahead of the counter: once the
        // counter passes `end`, the unsigned difference `end - counter`
        // wraps to a value >= schedule_periods and the loop retries.
        loop {
            let end = counter.wrapping_add(schedule_periods);
            hpet.oneshot(end);
            counter = hpet.read_counter();
            if end.wrapping_sub(counter) < schedule_periods {
                break;
            }
        }
        advance_to(hpet, counter);
    });
}

const CMOS_ADDR: u16 = 0x70;
const CMOS_DATA: u16 = 0x71;

fn read_cmos_reg(reg: u8) -> u8 {
    // SAFETY: the CMOS index/data ports are architectural.
    unsafe {
        Port::new(CMOS_ADDR).write(reg);
        Port::new(CMOS_DATA).read()
    }
}

/// Waits until the RTC update-in-progress flag (status A bit 7) clears.
fn wait_for_cmos() {
    while read_cmos_reg(0x0A) & (1 << 7) != 0 {}
}

/// Reads the CMOS clock as UNIX seconds. The RTC may be mid-update, so the
/// value is read repeatedly until two reads agree.
pub fn read_cmos_time() -> i64 {
    wait_for_cmos();
    let mut t = read_cmos_time_once();
    loop {
        wait_for_cmos();
        let t2 = read_cmos_time_once();
        if t2 == t {
            return t;
        }
        t = t2;
    }
}

fn read_cmos_time_once() -> i64 {
    let mut sec = read_cmos_reg(0x00);
    let mut min = read_cmos_reg(0x02);
    let mut hour = read_cmos_reg(0x04);
    let mut day = read_cmos_reg(0x07);
    let mut month = read_cmos_reg(0x08);
    let mut year = read_cmos_reg(0x09);
    let mut century = read_cmos_reg(0x32);
    let status_b = read_cmos_reg(0x0B);

    // 12-hour format: bit 7 of the hour is PM.
    let mut pm = false;
    if status_b & (1 << 1) != 0 {
        pm = hour & (1 << 7) != 0;
        hour &= 0x7F;
    }
    // BCD encoding unless the binary bit is set.
    if status_b & (1 << 2) == 0 {
        let dec = |v: u8| (v & 0x0F) + (v / 16) * 10;
        sec = dec(sec);
        min = dec(min);
        hour = dec(hour);
        day = dec(day);
        month = dec(month);
        year = dec(year);
        century = dec(century);
    }
    if pm {
        hour = (hour + 12) % 24;
    }
    let year = century as i64 * 100 + year as i64;
    days_from_civil(year, month as i64, day as i64) * 86_400
        + hour as i64 * 3_600
        + min as i64 * 60
        + sec as i64
}

/// Days since 1970-01-01 for a civil date (month 1-12, day 1-31).
pub(crate) fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}
