//! Kernel heap allocation.
//!
//! The heap lives in a fixed demand-paged reservation: only the pages the
//! allocator actually touches get physical frames, through the ordinary
//! page-fault path.

use linked_list_allocator::LockedHeap;
use x86_64::structures::paging::PageTableFlags;

use crate::error::KernelError;
use crate::mem;

/// The start address of the kernel heap.
pub const HEAP_START: usize = 0x_4444_4444_0000;
/// The size of the kernel heap reservation.
pub const HEAP_SIZE: usize = 1024 * 1024; // 1 MiB

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Reserves the heap range and hands it to the allocator.
///
/// Must run after trap dispatch is live: the allocator's first write
/// faults in the first heap page.
pub fn init() -> Result<(), KernelError> {
    let flags = PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
    if !mem::vmap_reserve_fixed(HEAP_START as u64, HEAP_SIZE as u64, flags) {
        return Err(KernelError::AddressInUse);
    }
    // SAFETY: the range was just reserved exclusively for the heap.
    unsafe {
        ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE);
    }
    Ok(())
}
