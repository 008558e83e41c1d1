//! Memory management.
//!
//! Boot receives the firmware memory map and the kernel's own ELF image and
//! turns them into: a physical frame bitmap, a fresh 4-level page table, a
//! physical identity map in the upper half of the address space, and a
//! virtual range map that backs demand paging from then on.
//!
//! The low half belongs to the hosted runtime. Nothing below 1 MiB is ever
//! handed out, so stray null dereferences keep faulting.

pub mod bitmap;
pub mod elf;
pub mod paging;
pub mod ranges;

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::registers::model_specific::{Efer, EferFlags};
use x86_64::structures::paging::{PageTable, PageTableFlags};
use x86_64::{PhysAddr, structures::paging::PhysFrame};

use crate::cell::KernelCell;
use crate::error::KernelError;
use bitmap::FrameBitmap;
use elf::ElfImage;
use paging::PagingFeatures;
use ranges::VirtRanges;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE_2M: u64 = 1 << 21;
pub const PAGE_SIZE_1G: u64 = 1 << 30;
pub const PAGE_SIZE_ROOT: u64 = 1 << 39;

/// Size of the virtual reservation that holds the range map's own slab.
pub const VIRT_MAP_SIZE: u64 = 1 << 30;

/// Fixed address of the vDSO page; the hosted runtime expects
/// `gettimeofday` there when no dynamic vDSO is advertised.
pub const VDSO_ADDRESS: u64 = 0xFFFF_FFFF_FF60_0000;

const EFI_MEMORY_RUNTIME: u64 = 0x8000_0000_0000_0000;

/// Version-1 EFI memory descriptor.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct EfiMemoryDescriptor {
    pub kind: u32,
    pad: u32,
    pub phys_start: u64,
    pub virt_start: u64,
    pub num_pages: u64,
    pub attribute: u64,
}

pub const EFI_LOADER_CODE: u32 = 1;
pub const EFI_LOADER_DATA: u32 = 2;
pub const EFI_BOOT_SERVICES_CODE: u32 = 3;
pub const EFI_BOOT_SERVICES_DATA: u32 = 4;
pub const EFI_CONVENTIONAL_MEMORY: u32 = 7;

impl EfiMemoryDescriptor {
    /// Whether the region must stay mapped for UEFI runtime services.
    pub fn is_runtime(&self) -> bool {
        self.attribute & EFI_MEMORY_RUNTIME != 0
    }

    /// Whether the region is available for the kernel's own use.
    pub fn is_usable(&self) -> bool {
        if self.is_runtime() {
            return false;
        }
        matches!(
            self.kind,
            EFI_LOADER_CODE
                | EFI_LOADER_DATA
                | EFI_BOOT_SERVICES_CODE
                | EFI_BOOT_SERVICES_DATA
                | EFI_CONVENTIONAL_MEMORY
        )
    }

    pub fn end(&self) -> u64 {
        self.phys_start + self.num_pages * PAGE_SIZE as u64
    }
}

/// The firmware memory map as handed over by the loader: a byte buffer of
/// descriptors at a firmware-chosen stride.
pub struct EfiMemoryMap {
    ptr: *const u8,
    len: usize,
    stride: usize,
}

impl EfiMemoryMap {
    /// # Safety
    ///
    /// `ptr` must point to `len` bytes of version-1 descriptors with the
    /// given stride, alive until [`free_loader_mem`] has run.
    pub unsafe fn from_raw(ptr: *const u8, len: usize, stride: usize) -> Self {
        Self { ptr, len, stride }
    }

    pub fn len(&self) -> usize {
        self.len / self.stride
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads descriptor `i` by value.
    pub fn descriptor(&self, i: usize) -> EfiMemoryDescriptor {
        let off = i * self.stride;
        // SAFETY: from_raw's contract; read_unaligned tolerates any stride.
        unsafe {
            core::ptr::read_unaligned(self.ptr.add(off) as *const EfiMemoryDescriptor)
        }
    }

    pub fn descriptors(&self) -> impl Iterator<Item = EfiMemoryDescriptor> + '_ {
        (0..self.len()).map(move |i| self.descriptor(i))
    }

    fn relocate(&mut self, offset: u64) {
        self.ptr = (self.ptr as u64 + offset) as *const u8;
    }
}

/// The kernel's own ELF image, kept addressable across the address-space
/// switch.
pub struct KernelImage {
    ptr: *const u8,
    len: usize,
}

impl KernelImage {
    /// # Safety
    ///
    /// `ptr` must point to `len` readable bytes holding the loaded image.
    pub unsafe fn from_raw(ptr: *const u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: from_raw's contract.
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn relocate(&mut self, offset: u64) {
        self.ptr = (self.ptr as u64 + offset) as *const u8;
    }
}

struct RootTable {
    phys: u64,
    virt: *mut PageTable,
}

static PHYS_MAP_OFFSET: AtomicU64 = AtomicU64::new(0);
static FRAMES: KernelCell<FrameBitmap> = KernelCell::new(FrameBitmap::empty());
static ROOT: KernelCell<RootTable> = KernelCell::new(RootTable {
    phys: 0,
    virt: core::ptr::null_mut(),
});
static VMAP: KernelCell<VirtRanges> = KernelCell::new(VirtRanges::empty());
static FEATURES: KernelCell<PagingFeatures> = KernelCell::new(PagingFeatures::baseline());

/// Offset at which all of physical memory is mapped. Zero until the
/// address-space switch.
pub fn phys_map_offset() -> u64 {
    PHYS_MAP_OFFSET.load(Ordering::Relaxed)
}

/// Translates a physical address into a dereferenceable pointer.
pub fn phys_to_virt(paddr: u64) -> *mut u8 {
    (phys_map_offset() + paddr) as *mut u8
}

/// Allocates up to `max_bytes` of zero-filled physically contiguous
/// memory; returns the physical address and actual size.
pub fn alloc_zeroed(max_bytes: usize) -> Result<(u64, usize), KernelError> {
    let (addr, size) = FRAMES
        .with(|frames| frames.alloc(max_bytes))
        .ok_or(KernelError::OutOfMemory)?;
    // SAFETY: the frames were just taken off the free bitmap and the whole
    // of physical memory is addressable through the physical map.
    unsafe { core::ptr::write_bytes(phys_to_virt(addr), 0, size) };
    Ok((addr, size))
}

/// Maps `[start, end)` onto the physical range at `paddr`.
fn map_range(start: u64, end: u64, paddr: u64, flags: PageTableFlags) -> Result<(), KernelError> {
    let feats = FEATURES.with(|f| *f);
    FRAMES.with(|frames| {
        ROOT.with(|root| {
            // SAFETY: root points at the boot-constructed hierarchy and the
            // callers own the physical ranges they map.
            unsafe { paging::mmap_aligned(frames, root.virt, start, end, paddr, flags, &feats) }
        })
    })
}

/// Initializes all of memory management from the firmware map and the
/// kernel image, finishing with the CR3 switch onto the kernel's own page
/// tables and the release of the loader's scratch memory.
pub fn init_memory(
    efi_map: &mut EfiMemoryMap,
    image: &mut KernelImage,
) -> Result<(), KernelError> {
    let feats = paging::detect_features();
    if feats.nx {
        // SAFETY: the CPU advertises NX; enabling NXE only arms the bit.
        unsafe { Efer::update(|f| f.insert(EferFlags::NO_EXECUTE_ENABLE)) };
    }
    FEATURES.with(|f| *f = feats);

    init_bitmap(efi_map)?;
    reserve_image(image)?;

    // Top-level table.
    let (root_phys, _) = alloc_zeroed(PAGE_SIZE)?;
    ROOT.with(|r| {
        r.phys = root_phys;
        r.virt = phys_to_virt(root_phys) as *mut PageTable;
    });

    // The range-map slab and the physical identity map live in the upper
    // half, addresses sign extended into canonical form.
    let virt_map_start = (feats.max_virt_addr >> 1) | !(feats.max_virt_addr - 1);
    let virt_map_end = virt_map_start + VIRT_MAP_SIZE;

    identity_map_usable(efi_map, virt_map_end)?;
    identity_map_kernel(image)?;
    switch_memory_map(efi_map, image, virt_map_end);

    init_virt_map(virt_map_start)?;
    add_kernel_ranges(image)?;
    // Reserve the rest of the upper half, up to the vDSO page, so user
    // reservations never land over the physical map.
    VMAP.with(|vm| {
        vm.must_add(
            phys_map_offset(),
            VDSO_ADDRESS,
            PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
        )
    });
    map_reserved(efi_map)?;
    free_loader_mem(efi_map);
    Ok(())
}

fn init_bitmap(efi_map: &EfiMemoryMap) -> Result<(), KernelError> {
    let mut min_addr = u64::MAX;
    let mut max_addr = 0u64;
    let mut largest: Option<EfiMemoryDescriptor> = None;
    for desc in efi_map.descriptors() {
        if !desc.is_usable() {
            continue;
        }
        min_addr = min_addr.min(desc.phys_start);
        max_addr = max_addr.max(desc.end());
        // The memory map itself lives in a LoaderData region; don't place
        // the bitmap over data we are still reading.
        if desc.kind == EFI_LOADER_DATA {
            continue;
        }
        let bigger = match largest {
            Some(l) => desc.num_pages > l.num_pages,
            None => true,
        };
        if bigger {
            largest = Some(desc);
        }
    }
    let largest = largest.ok_or(KernelError::NoUsableMemory)?;

    let page = PAGE_SIZE as u64;
    let range = max_addr - min_addr;
    let nbits = (range + page - 1) / page;
    let nbytes = (nbits + 7) / 8;
    let npages = (nbytes + page - 1) / page;
    if npages > largest.num_pages {
        return Err(KernelError::BitmapTooLarge);
    }
    let nwords = ((nbytes + 7) / 8) as usize;

    FRAMES.with(|frames| {
        // SAFETY: the backing words sit in the largest usable region, which
        // is reserved right below, and the physical map makes them
        // addressable.
        *frames = unsafe {
            FrameBitmap::from_raw(phys_to_virt(largest.phys_start) as *mut u64, nwords, min_addr)
        };
        for desc in efi_map.descriptors() {
            if !desc.is_usable() || desc.kind == EFI_LOADER_DATA {
                continue;
            }
            if desc.phys_start < desc.end() {
                frames.set_free(true, desc.phys_start, desc.end());
            }
        }
        frames.set_free(
            false,
            largest.phys_start,
            largest.phys_start + npages * page,
        );
    });
    Ok(())
}

/// Reserves the physical pages holding the kernel image's PT_LOAD
/// segments.
fn reserve_image(image: &KernelImage) -> Result<(), KernelError> {
    let elf = ElfImage::new(image.as_slice())?;
    FRAMES.with(|frames| {
        for seg in elf.load_segments() {
            let (start, end) = seg.page_range();
            frames.set_free(false, start, end);
        }
    });
    Ok(())
}

/// Maps every usable physical byte at `offset`, making physical memory
/// directly addressable for page tables and DMA bookkeeping.
fn identity_map_usable(efi_map: &EfiMemoryMap, offset: u64) -> Result<(), KernelError> {
    let mut start = u64::MAX;
    let mut end = 0u64;
    for desc in efi_map.descriptors() {
        if !desc.is_usable() {
            continue;
        }
        start = start.min(desc.phys_start);
        end = end.max(desc.end());
    }
    if start > end {
        return Err(KernelError::NoUsableMemory);
    }
    let vaddr = offset + start;
    map_range(
        vaddr,
        vaddr + (end - start),
        start,
        PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
    )
}

/// Maps the kernel's PT_LOAD segments at their link addresses, which the
/// UEFI loader made equal to their physical load addresses.
fn identity_map_kernel(image: &KernelImage) -> Result<(), KernelError> {
    let elf = ElfImage::new(image.as_slice())?;
    for seg in elf.load_segments() {
        let (start, end) = seg.page_range();
        map_range(
            start,
            end,
            start,
            seg.page_flags() | PageTableFlags::USER_ACCESSIBLE,
        )?;
    }
    Ok(())
}

/// Activates the new page tables and re-bases every pointer that was
/// handed out as a raw physical address.
fn switch_memory_map(efi_map: &mut EfiMemoryMap, image: &mut KernelImage, offset: u64) {
    let root_phys = ROOT.with(|r| r.phys);
    // SAFETY: the hierarchy maps the executing kernel (identity) and all of
    // physical memory (at `offset`), so execution continues seamlessly.
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(root_phys)),
            Cr3Flags::empty(),
        );
    }
    PHYS_MAP_OFFSET.store(offset, Ordering::Relaxed);
    ROOT.with(|r| r.virt = (r.virt as u64 + offset) as *mut PageTable);
    FRAMES.with(|f| f.relocate(offset));
    efi_map.relocate(offset);
    image.relocate(offset);
}

/// Creates the virtual range map over its slab reservation. The first slab
/// page is mapped eagerly so the map can record itself; the rest faults in
/// on demand.
fn init_virt_map(start: u64) -> Result<(), KernelError> {
    let flags = PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
    let (page, _) = alloc_zeroed(PAGE_SIZE)?;
    map_range(start, start + PAGE_SIZE as u64, page, flags)?;
    let cap = (VIRT_MAP_SIZE as usize) / core::mem::size_of::<ranges::MemoryRange>();
    VMAP.with(|vm| {
        // SAFETY: the slab reservation is exclusive to the range map and
        // its pages fault in lazily once the map records itself below.
        *vm = unsafe { VirtRanges::from_raw(start as *mut ranges::MemoryRange, cap) };
        vm.must_add(start, start + VIRT_MAP_SIZE, flags);
    });
    Ok(())
}

/// Registers the kernel image segments in the range map so later
/// reservations cannot collide with them.
fn add_kernel_ranges(image: &KernelImage) -> Result<(), KernelError> {
    let elf = ElfImage::new(image.as_slice())?;
    VMAP.with(|vm| {
        for seg in elf.load_segments() {
            let (start, end) = seg.page_range();
            vm.must_add(start, end, seg.page_flags() | PageTableFlags::USER_ACCESSIBLE);
        }
    });
    Ok(())
}

/// Identity maps regions the UEFI runtime expects to stay resident.
fn map_reserved(efi_map: &EfiMemoryMap) -> Result<(), KernelError> {
    for desc in efi_map.descriptors() {
        if !desc.is_runtime() {
            continue;
        }
        let start = desc.phys_start;
        let end = desc.end();
        let flags = PageTableFlags::WRITABLE;
        VMAP.with(|vm| vm.must_add(start, end, flags));
        map_range(start, end, start, flags)?;
    }
    Ok(())
}

/// Releases the loader's scratch memory once the memory map and kernel
/// image have been consumed or re-based. Nothing may hold references into
/// LoaderData regions past this point.
fn free_loader_mem(efi_map: &EfiMemoryMap) {
    FRAMES.with(|frames| {
        for desc in efi_map.descriptors() {
            if desc.kind == EFI_LOADER_DATA {
                frames.set_free(true, desc.phys_start, desc.end());
            }
        }
    });
}

/// Demand-paging entry point, called from the page-fault handler with the
/// faulting address. Commits one zeroed frame if a reserved range covers
/// the page and permits access.
pub fn fault_page(addr: u64) -> Result<(), KernelError> {
    let addr = addr & !(PAGE_SIZE as u64 - 1);
    // SAFETY: this may interrupt a range-map mutation, but insertions shift
    // tail-first so a read-only lookup always sees a consistent array.
    let range = unsafe { (*VMAP.raw()).range_for(addr, PAGE_SIZE as u64) }
        .ok_or(KernelError::UnmappedFault)?;
    if range.flags == PageTableFlags::NO_EXECUTE {
        return Err(KernelError::ProtNoneFault);
    }
    let (frame, _) = alloc_zeroed(PAGE_SIZE)?;
    map_range(addr, addr + PAGE_SIZE as u64, frame, range.flags)
}

/// Maps a device register window at its physical address.
pub fn map_mmio(addr: u64, size: u64, flags: PageTableFlags) -> Result<(), KernelError> {
    VMAP.with(|vm| vm.must_add(addr, addr + size, flags));
    map_range(addr, addr + size, addr, flags)
}

/// Reserves an anonymous user range; pages are committed on first touch.
pub fn user_mmap(hint: u64, size: u64) -> Result<u64, KernelError> {
    let flags = PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    VMAP.with(|vm| vm.mmap(hint, size, flags))
}

/// Reserves a fixed user range; returns false on overlap, which callers
/// treat as "already mapped".
pub fn user_mmap_fixed(addr: u64, size: u64) -> bool {
    let flags = PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    VMAP.with(|vm| vm.mmap_fixed(addr, size, flags))
}

/// Reserves an anonymous kernel range with explicit flags.
pub fn vmap_reserve(hint: u64, size: u64, flags: PageTableFlags) -> Result<u64, KernelError> {
    VMAP.with(|vm| vm.mmap(hint, size, flags))
}

/// Reserves a fixed range with explicit flags.
pub fn vmap_reserve_fixed(addr: u64, size: u64, flags: PageTableFlags) -> bool {
    VMAP.with(|vm| vm.mmap_fixed(addr, size, flags))
}

/// Backs `[vaddr, vaddr + size)` of an existing reservation with the
/// physically contiguous range at `paddr`. Both addresses and the size
/// must be page aligned.
pub fn iomap(vaddr: u64, paddr: u64, size: u64) -> Result<(), KernelError> {
    let page = PAGE_SIZE as u64;
    if vaddr & (page - 1) != 0 || paddr & (page - 1) != 0 {
        return Err(KernelError::InvalidArgument);
    }
    let size = (size + page - 1) & !(page - 1);
    let range = VMAP
        .with(|vm| vm.range_for(vaddr, size))
        .ok_or(KernelError::InvalidArgument)?;
    map_range(vaddr, vaddr + size, paddr, range.flags).map_err(|_| KernelError::OutOfMemory)
}

/// Walks the live page tables and checks that no two mappings below the
/// physical map alias the same physical page.
pub fn verify_page_tables() -> bool {
    let feats = FEATURES.with(|f| *f);
    let root = ROOT.with(|r| r.virt as *const PageTable);
    // SAFETY: the hierarchy is live and reachable through the physical map.
    let entries = unsafe { paging::dump(root, feats.max_virt_addr) };
    paging::verify(&entries, phys_map_offset())
}
