//! Global Descriptor Table and Task State Segment.
//!
//! Segmentation is mostly vestigial in 64-bit mode, but a GDT and a TSS are
//! still required: the TSS provides the interrupt stacks and SYSCALL/SYSRET
//! hardcode the selector layout. The entry order below is fixed by SYSRET
//! (see Intel SDM Vol. 3, "Fast System Calls in 64-bit Mode"): ring-3
//! 32-bit code, ring-3 data and ring-3 64-bit code must be consecutive.

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, DescriptorFlags, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// Size of each statically allocated kernel stack.
pub const STACK_SIZE: usize = 10 * 4096;

/// IST slot for every trap except page faults (1-based, as the hardware
/// counts them).
pub const IST_GENERIC: u16 = 1;

/// IST slot for page faults. Page faults get their own stack so a fault
/// taken during interrupt entry is still recoverable.
pub const IST_PAGE_FAULT: u16 = 2;

#[repr(C, align(16))]
struct Stack([u8; STACK_SIZE]);

/// Interrupt stack (IST1), also used as RSP0 on ring transitions.
static mut INTERRUPT_STACK: Stack = Stack([0; STACK_SIZE]);

/// Dedicated page-fault stack (IST2).
static mut PAGE_FAULT_STACK: Stack = Stack([0; STACK_SIZE]);

/// Kernel stack: boot, SYSCALL dispatch and the scheduler run here.
/// Exported so the `_start` stub can install it before any Rust runs.
#[no_mangle]
static mut KERNEL_STACK: Stack = Stack([0; STACK_SIZE]);

/// Top of the kernel stack, read by the assembly trampolines when they
/// switch off the interrupt stacks. Written once during [`init`].
#[no_mangle]
pub static mut KERNEL_STACK_TOP: u64 = 0;

fn stack_top(stack: *const Stack) -> VirtAddr {
    // The stack arrays are 16-byte aligned and their size is a multiple of
    // 16, so the top is suitably aligned for an interrupt frame.
    VirtAddr::from_ptr(stack) + STACK_SIZE
}

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        // SAFETY: only the addresses of the stack statics are taken.
        let ist_top = stack_top(unsafe { core::ptr::addr_of!(INTERRUPT_STACK) });
        let pf_top = stack_top(unsafe { core::ptr::addr_of!(PAGE_FAULT_STACK) });
        tss.interrupt_stack_table[(IST_GENERIC - 1) as usize] = ist_top;
        tss.interrupt_stack_table[(IST_PAGE_FAULT - 1) as usize] = pf_top;
        tss.privilege_stack_table[0] = ist_top;
        // An I/O map base beyond the segment limit blocks all ports from
        // ring 3.
        tss.iomap_base = core::mem::size_of::<TaskStateSegment>() as u16;
        tss
    };
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code0 = gdt.add_entry(Descriptor::kernel_code_segment());
        let data0 = gdt.add_entry(Descriptor::kernel_data_segment());
        let user_code32 =
            gdt.add_entry(Descriptor::UserSegment(DescriptorFlags::USER_CODE32.bits()));
        let user_data = gdt.add_entry(Descriptor::user_data_segment());
        let user_code64 = gdt.add_entry(Descriptor::user_code_segment());
        let tss = gdt.add_entry(Descriptor::tss_segment(&TSS));
        (
            gdt,
            Selectors {
                code0,
                data0,
                user_code32,
                user_data,
                user_code64,
                tss,
            },
        )
    };
}

/// The selectors the rest of the kernel needs.
#[derive(Debug, Clone, Copy)]
pub struct Selectors {
    pub code0: SegmentSelector,
    pub data0: SegmentSelector,
    pub user_code32: SegmentSelector,
    pub user_data: SegmentSelector,
    pub user_code64: SegmentSelector,
    pub tss: SegmentSelector,
}

/// Returns the selector set.
pub fn selectors() -> Selectors {
    GDT.1
}

/// Top of the kernel stack used by SYSCALL entry and the scheduler.
pub fn kernel_stack_top() -> VirtAddr {
    // SAFETY: only the address of the stack static is taken.
    stack_top(unsafe { core::ptr::addr_of!(KERNEL_STACK) })
}

/// Loads the GDT and TSS and reloads every segment register.
///
/// GS is loaded with the kernel data selector here; the per-thread GS base
/// is installed through `IA32_GS_BASE` afterwards, so this must run before
/// the first thread is made current.
pub fn init() {
    GDT.0.load();
    let sels = GDT.1;
    // SAFETY: the selectors reference the GDT loaded above.
    unsafe {
        CS::set_reg(sels.code0);
        SS::set_reg(sels.data0);
        DS::set_reg(sels.data0);
        ES::set_reg(sels.data0);
        FS::set_reg(sels.data0);
        GS::set_reg(sels.data0);
        load_tss(sels.tss);
        KERNEL_STACK_TOP = kernel_stack_top().as_u64();
    }
}
