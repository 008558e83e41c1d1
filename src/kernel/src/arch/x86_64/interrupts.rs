//! Interrupt Descriptor Table, local APIC and trap handlers.
//!
//! All 256 vectors are trap gates: the hardware leaves IF alone and each
//! trampoline clears it itself (see `trampolines.rs`). Handlers here run
//! with interrupts disabled on a kernel-owned stack.

use core::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use crate::arch::x86_64::{cpuid, gdt, rdmsr, trampolines, wrmsr};
use crate::cell::KernelCell;
use crate::error::KernelError;
use crate::{mem, thread};

const IA32_APIC_BASE: u32 = 0x1B;

/// Fault vectors handled by this kernel.
pub const INT_DIVIDE_ERROR: u8 = 0x00;
pub const INT_GENERAL_PROTECTION: u8 = 0x0D;
pub const INT_PAGE_FAULT: u8 = 0x0E;
pub const INT_SSE: u8 = 0x13;

/// First vector past the legacy PIC range.
pub const INT_APIC_ERROR: u8 = 0x21;
pub const INT_TIMER: u8 = 0x22;

/// First of the vectors handed out to devices through MSI-X.
pub const INT_FIRST_USER: u8 = 0x23;
/// Number of device vectors.
pub const USER_VECTORS: usize = 10;

pub const INT_SPURIOUS: u8 = 0xFF;

/// Message address programmed into MSI capable devices; the low bits select
/// CPU 0 with fixed delivery.
pub const MSI_MESSAGE_ADDRESS: u64 = 0xFEE0_0000;

/// Interrupts recorded by device vectors and drained by the scheduler.
///
/// Plain byte stores are enough: the writers run with interrupts disabled
/// and the scheduler scans with interrupts disabled.
static PENDING_INTERRUPTS: KernelCell<[bool; USER_VECTORS]> =
    KernelCell::new([false; USER_VECTORS]);

/// Virtual address of the local APIC registers, identity mapped uncached.
static APIC_BASE: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        // SAFETY: every handler address is a trampoline defined in
        // trampolines.rs with the matching frame expectations, and the IST
        // indices name stacks installed in the TSS.
        unsafe {
            idt.divide_error
                .set_handler_addr(VirtAddr::new(trampolines::div_trampoline as u64))
                .set_stack_index(gdt::IST_GENERIC - 1)
                .disable_interrupts(false);
            idt.general_protection_fault
                .set_handler_addr(VirtAddr::new(trampolines::gp_trampoline as u64))
                .set_stack_index(gdt::IST_GENERIC - 1)
                .disable_interrupts(false);
            idt.page_fault
                .set_handler_addr(VirtAddr::new(trampolines::page_fault_trampoline as u64))
                .set_stack_index(gdt::IST_PAGE_FAULT - 1)
                .disable_interrupts(false);
            idt.simd_floating_point
                .set_handler_addr(VirtAddr::new(trampolines::sse_trampoline as u64))
                .set_stack_index(gdt::IST_GENERIC - 1)
                .disable_interrupts(false);

            let mut install = |vector: u8, handler: u64| {
                idt[vector as usize]
                    .set_handler_addr(VirtAddr::new(handler))
                    .set_stack_index(gdt::IST_GENERIC - 1)
                    .disable_interrupts(false);
            };
            install(INT_APIC_ERROR, trampolines::unknown_int_trampoline as u64);
            install(INT_SPURIOUS, trampolines::unknown_int_trampoline as u64);
            install(INT_TIMER, trampolines::timer_trampoline as u64);

            let user = [
                trampolines::user_intr_trampoline_0 as u64,
                trampolines::user_intr_trampoline_1 as u64,
                trampolines::user_intr_trampoline_2 as u64,
                trampolines::user_intr_trampoline_3 as u64,
                trampolines::user_intr_trampoline_4 as u64,
                trampolines::user_intr_trampoline_5 as u64,
                trampolines::user_intr_trampoline_6 as u64,
                trampolines::user_intr_trampoline_7 as u64,
                trampolines::user_intr_trampoline_8 as u64,
                trampolines::user_intr_trampoline_9 as u64,
            ];
            for (i, &handler) in user.iter().enumerate() {
                install(INT_FIRST_USER + i as u8, handler);
            }
        }
        idt
    };
}

/// Initializes trap dispatch: masks the legacy PICs, loads the IDT, then
/// enables the local APIC with LINT0/1 masked and the spurious and error
/// vectors armed.
pub fn init() -> Result<(), KernelError> {
    let (_, _, _, edx) = cpuid(0x1, 0);
    if edx & (1 << 9) == 0 {
        return Err(KernelError::NoApic);
    }

    // The PICs would otherwise deliver spurious vectors into our range.
    // SAFETY: remapping then masking the legacy PICs touches only their
    // well-known command/data ports.
    unsafe {
        let mut pics = ChainedPics::new(0x20, 0x28);
        pics.initialize();
        pics.disable();
    }

    // SAFETY: IA32_APIC_BASE exists on every CPU that passed the check
    // above.
    let apic_base_msr = unsafe { rdmsr(IA32_APIC_BASE) };
    if apic_base_msr & (1 << 8) == 0 {
        // Not the bootstrap processor; a second CPU has no business here.
        return Err(KernelError::NoApic);
    }
    let base = apic_base_msr & !0xFFF;
    // SAFETY: setting the global-enable bit at the firmware-reported base.
    unsafe { wrmsr(IA32_APIC_BASE, apic_base_msr | 1 << 11) };

    // Map the register page uncached at its physical address.
    let flags = PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE | PageTableFlags::NO_CACHE;
    mem::map_mmio(base, mem::PAGE_SIZE as u64, flags)?;
    APIC_BASE.store(base, Ordering::Relaxed);

    IDT.load();

    const LVT_MASKED: u32 = 1 << 16;
    apic_write(0x350, LVT_MASKED); // LVT LINT0
    apic_write(0x360, LVT_MASKED); // LVT LINT1
    apic_write(0x370, INT_APIC_ERROR as u32); // LVT Error
    // Spurious vector register: arm the vector and software-enable the APIC.
    apic_write(0x0F0, 0x100 | INT_SPURIOUS as u32);
    Ok(())
}

fn apic_write(reg: usize, val: u32) {
    let base = APIC_BASE.load(Ordering::Relaxed);
    // SAFETY: the register page was mapped uncached in init(); volatile
    // because these are device registers.
    unsafe { core::ptr::write_volatile((base as usize + reg) as *mut u32, val) };
}

/// Signals end-of-interrupt to the local APIC.
///
/// This is the single acknowledge path for every vector the APIC delivers,
/// timer and MSI alike.
pub fn eoi() {
    apic_write(0xB0, 0);
}

/// Removes and returns the index of one pending device interrupt.
pub fn take_pending() -> Option<usize> {
    PENDING_INTERRUPTS.with(|pending| {
        for (i, p) in pending.iter_mut().enumerate() {
            if *p {
                *p = false;
                return Some(i);
            }
        }
        None
    })
}

/// Device vector handler: records the interrupt for the scheduler and
/// acknowledges the APIC. Called from the per-vector trampolines.
#[no_mangle]
extern "C" fn user_interrupt(index: u64) {
    PENDING_INTERRUPTS.with(|pending| pending[index as usize] = true);
    eoi();
}

/// Timer vector handler: acknowledges the APIC and reschedules. The saved
/// context of the interrupted thread is already in its thread structure.
#[no_mangle]
extern "C" fn timer_interrupt() -> ! {
    eoi();
    thread::interrupt_schedule()
}

/// Page fault handler. Recoverable lazy-commit faults return to the
/// trampoline, which resumes the faulting thread; everything else halts.
#[no_mangle]
extern "C" fn page_fault_interrupt(error_code: u64, addr: u64) {
    const FAULT_PRESENT: u64 = 1 << 0;
    if error_code & FAULT_PRESENT != 0 {
        crate::serial_println!("page fault address: {:#x}", addr);
        crate::fatal("page fault: protection violation on present page");
    }
    if let Err(err) = mem::fault_page(addr) {
        crate::serial_println!("page fault address: {:#x}", addr);
        crate::fatal_error("page fault", err);
    }
}

#[no_mangle]
extern "C" fn gp_fault(error_code: u64) -> ! {
    crate::serial_println!("selector error code: {:#x}", error_code);
    crate::fatal("general protection fault");
}

#[no_mangle]
extern "C" fn div_fault() -> ! {
    crate::fatal("division by zero");
}

#[no_mangle]
extern "C" fn sse_fault() -> ! {
    crate::fatal("SSE exception");
}

#[no_mangle]
extern "C" fn unknown_interrupt() -> ! {
    crate::fatal("unexpected interrupt");
}
