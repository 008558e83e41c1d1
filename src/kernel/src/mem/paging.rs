//! Four-level page table engine.
//!
//! Maps aligned virtual ranges onto physical memory with the largest page
//! size the alignment allows: 1 GiB where the CPU supports it and both
//! addresses are 1 GiB aligned with at least that much left, else 2 MiB,
//! else 4 KiB. Intermediate tables are allocated on demand from the frame
//! bitmap.
//!
//! Tables are always reached through the physical map offset, so the same
//! walker works before and after the address-space switch.

use alloc::vec::Vec;

use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags};
use x86_64::PhysAddr;

use crate::arch::x86_64::{cpuid, cpuid_max_ext};
use crate::error::KernelError;
use crate::mem::bitmap::FrameBitmap;
use crate::mem::{phys_to_virt, PAGE_SIZE, PAGE_SIZE_1G, PAGE_SIZE_2M, PAGE_SIZE_ROOT};

/// Paging-related CPU capabilities, probed once at boot.
#[derive(Debug, Clone, Copy)]
pub struct PagingFeatures {
    /// The CPU honours the no-execute bit.
    pub nx: bool,
    /// 1 GiB pages are available.
    pub huge_1g: bool,
    /// One past the highest canonical-positive virtual address.
    pub max_virt_addr: u64,
}

impl PagingFeatures {
    pub const fn baseline() -> Self {
        Self {
            nx: false,
            huge_1g: false,
            max_virt_addr: 1 << 32,
        }
    }
}

/// Probes NX, 1 GiB page support and the virtual address width.
pub fn detect_features() -> PagingFeatures {
    let mut feats = PagingFeatures::baseline();
    let max_ext = cpuid_max_ext();
    if max_ext < 0x8000_0001 {
        return feats;
    }
    let (_, _, _, edx) = cpuid(0x8000_0001, 0);
    feats.nx = edx & (1 << 20) != 0;
    feats.huge_1g = edx & (1 << 26) != 0;
    if edx & (1 << 29) != 0 {
        feats.max_virt_addr = 1 << 48;
    }
    if max_ext < 0x8000_0008 {
        return feats;
    }
    let (eax, _, _, _) = cpuid(0x8000_0008, 0);
    let virt_width = (eax >> 8) & 0xFF;
    feats.max_virt_addr = 1u64 << virt_width;
    feats
}

fn set_mapping(entry: &mut PageTableEntry, paddr: u64, mut flags: PageTableFlags, nx: bool) {
    if !nx {
        flags &= !PageTableFlags::NO_EXECUTE;
    }
    flags |= PageTableFlags::PRESENT;
    entry.set_addr(PhysAddr::new(paddr), flags);
}

/// Returns the next-level table behind `entry`, allocating and zeroing a
/// fresh one if the entry is empty.
unsafe fn lookup_or_create(
    frames: &mut FrameBitmap,
    table: *mut PageTable,
    index: usize,
) -> Result<*mut PageTable, KernelError> {
    let entry = &mut (&mut *table)[index];
    if entry.flags().contains(PageTableFlags::PRESENT) {
        if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            crate::fatal("lookup_or_create: entry maps a huge page, not a table");
        }
        return Ok(phys_to_virt(entry.addr().as_u64()) as *mut PageTable);
    }
    let (page, _) = frames
        .alloc(PAGE_SIZE)
        .ok_or(KernelError::OutOfMemory)?;
    let next = phys_to_virt(page) as *mut PageTable;
    core::ptr::write_bytes(next as *mut u8, 0, PAGE_SIZE);
    entry.set_addr(
        PhysAddr::new(page),
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
    );
    Ok(next)
}

/// Maps the virtual range `[start, end)` onto physical memory starting at
/// `paddr`. All three addresses must be page aligned.
///
/// # Safety
///
/// `root` must be the active or about-to-be-activated top-level table and
/// the physical range must be exclusively owned by the new mapping.
pub unsafe fn mmap_aligned(
    frames: &mut FrameBitmap,
    root: *mut PageTable,
    mut start: u64,
    end: u64,
    mut paddr: u64,
    flags: PageTableFlags,
    feats: &PagingFeatures,
) -> Result<(), KernelError> {
    if paddr % PAGE_SIZE as u64 != 0 {
        crate::fatal("mmap_aligned: physical address not page aligned");
    }
    while start < end {
        let size = end - start;
        let pml4e = ((start / PAGE_SIZE_ROOT) % 512) as usize;
        let pdpt = lookup_or_create(frames, root, pml4e)?;
        let pdpte = ((start / PAGE_SIZE_1G) % 512) as usize;
        if size >= PAGE_SIZE_1G
            && start % PAGE_SIZE_1G == 0
            && paddr % PAGE_SIZE_1G == 0
            && feats.huge_1g
        {
            set_mapping(
                &mut (&mut *pdpt)[pdpte],
                paddr,
                flags | PageTableFlags::HUGE_PAGE,
                feats.nx,
            );
            paddr += PAGE_SIZE_1G;
            start += PAGE_SIZE_1G;
            continue;
        }
        let pd = lookup_or_create(frames, pdpt, pdpte)?;
        let pde = ((start / PAGE_SIZE_2M) % 512) as usize;
        if size >= PAGE_SIZE_2M && start % PAGE_SIZE_2M == 0 && paddr % PAGE_SIZE_2M == 0 {
            set_mapping(
                &mut (&mut *pd)[pde],
                paddr,
                flags | PageTableFlags::HUGE_PAGE,
                feats.nx,
            );
            paddr += PAGE_SIZE_2M;
            start += PAGE_SIZE_2M;
            continue;
        }
        let pt = lookup_or_create(frames, pd, pde)?;
        let pte = ((start / PAGE_SIZE as u64) % 512) as usize;
        set_mapping(&mut (&mut *pt)[pte], paddr, flags, feats.nx);
        paddr += PAGE_SIZE as u64;
        start += PAGE_SIZE as u64;
    }
    Ok(())
}

/// One resolved mapping from a page-table walk.
#[derive(Debug, Clone, Copy)]
pub struct PtRange {
    pub vaddr: u64,
    pub paddr: u64,
    pub size: u64,
}

fn sign_extend(vaddr: u64, max_virt: u64) -> u64 {
    if vaddr & (max_virt >> 1) != 0 {
        vaddr | !(max_virt - 1)
    } else {
        vaddr
    }
}

fn table_behind(entry: &PageTableEntry) -> *const PageTable {
    phys_to_virt(entry.addr().as_u64()) as *const PageTable
}

/// Walks the whole hierarchy and lists every resolved mapping.
///
/// # Safety
///
/// `root` must point at a well-formed table hierarchy reachable through the
/// physical map.
pub unsafe fn dump(root: *const PageTable, max_virt: u64) -> Vec<PtRange> {
    let mut entries = Vec::new();
    for (i4, e4) in (*root).iter().enumerate() {
        if !e4.flags().contains(PageTableFlags::PRESENT) {
            continue;
        }
        let v4 = sign_extend(i4 as u64 * PAGE_SIZE_ROOT, max_virt);
        let pdpt = table_behind(e4);
        for (i3, e3) in (*pdpt).iter().enumerate() {
            if !e3.flags().contains(PageTableFlags::PRESENT) {
                continue;
            }
            let v3 = v4 + i3 as u64 * PAGE_SIZE_1G;
            if e3.flags().contains(PageTableFlags::HUGE_PAGE) {
                entries.push(PtRange {
                    vaddr: v3,
                    paddr: e3.addr().as_u64() & !(PAGE_SIZE_1G - 1),
                    size: PAGE_SIZE_1G,
                });
                continue;
            }
            let pd = table_behind(e3);
            for (i2, e2) in (*pd).iter().enumerate() {
                if !e2.flags().contains(PageTableFlags::PRESENT) {
                    continue;
                }
                let v2 = v3 + i2 as u64 * PAGE_SIZE_2M;
                if e2.flags().contains(PageTableFlags::HUGE_PAGE) {
                    entries.push(PtRange {
                        vaddr: v2,
                        paddr: e2.addr().as_u64() & !(PAGE_SIZE_2M - 1),
                        size: PAGE_SIZE_2M,
                    });
                    continue;
                }
                let pt = table_behind(e2);
                for (i1, e1) in (*pt).iter().enumerate() {
                    if !e1.flags().contains(PageTableFlags::PRESENT) {
                        continue;
                    }
                    entries.push(PtRange {
                        vaddr: v2 + i1 as u64 * PAGE_SIZE as u64,
                        paddr: e1.addr().as_u64(),
                        size: PAGE_SIZE as u64,
                    });
                }
            }
        }
    }
    entries
}

/// Checks that no two mappings below `ignore_above` share physical pages.
///
/// The physical map deliberately aliases all of memory in the upper half,
/// so mappings at or above `ignore_above` are skipped.
pub fn verify(entries: &[PtRange], ignore_above: u64) -> bool {
    let mut ranges: Vec<(u64, u64)> = entries
        .iter()
        .filter(|e| e.vaddr < ignore_above)
        .map(|e| (e.paddr, e.paddr + e.size))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        if pair[0].1 > pair[1].0 {
            crate::serial_println!(
                "overlapping physical range: [{:#x}, {:#x}) and [{:#x}, {:#x})",
                pair[0].0,
                pair[0].1,
                pair[1].0,
                pair[1].1
            );
            return false;
        }
    }
    true
}
