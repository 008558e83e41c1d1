//! Minimal ELF64 program header reader.
//!
//! The kernel and the hosted runtime travel as one ELF64 image; only the
//! program headers matter here, for mapping PT_LOAD segments and reserving
//! their physical pages.

use x86_64::structures::paging::PageTableFlags;

use crate::error::KernelError;
use crate::mem::ranges::page_align_up;

const ELF_MAGIC: u32 = 0x464C_457F;

/// A loadable segment.
pub const PT_LOAD: u32 = 1;

const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;

/// An ELF64 program header.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SegmentHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl SegmentHeader {
    /// Virtual start address of the segment.
    pub fn start(&self) -> u64 {
        self.p_vaddr
    }

    /// Virtual end address, with the size rounded up to the segment
    /// alignment the way the loader reserves it.
    pub fn end(&self) -> u64 {
        let align = self.p_align.max(1);
        let size = (self.p_memsz + align - 1) & !(align - 1);
        self.start() + size
    }

    /// Page flags derived from the segment flags: writable if PF_W,
    /// executable (NX cleared) if PF_X.
    pub fn page_flags(&self) -> PageTableFlags {
        let mut flags = PageTableFlags::NO_EXECUTE;
        if self.p_flags & PF_X != 0 {
            flags &= !PageTableFlags::NO_EXECUTE;
        }
        if self.p_flags & PF_W != 0 {
            flags |= PageTableFlags::WRITABLE;
        }
        flags
    }

    /// The segment range aligned out to whole pages.
    pub fn page_range(&self) -> (u64, u64) {
        (
            self.start() & !(crate::mem::PAGE_SIZE as u64 - 1),
            page_align_up(self.end()),
        )
    }
}

/// Program header view over an ELF64 image.
pub struct ElfImage<'a> {
    phdr: &'a [u8],
    phdr_size: usize,
    count: usize,
}

impl<'a> ElfImage<'a> {
    /// Parses the image header; fails on a bad magic or a truncated
    /// program header table.
    pub fn new(img: &'a [u8]) -> Result<Self, KernelError> {
        if img.len() < 64 {
            return Err(KernelError::BadElf);
        }
        let magic = u32::from_le_bytes(img[0..4].try_into().unwrap());
        if magic != ELF_MAGIC {
            return Err(KernelError::BadElf);
        }
        let phdr_off = u64::from_le_bytes(img[32..40].try_into().unwrap()) as usize;
        let phdr_size = u16::from_le_bytes(img[54..56].try_into().unwrap()) as usize;
        let count = u16::from_le_bytes(img[56..58].try_into().unwrap()) as usize;
        if phdr_size < core::mem::size_of::<SegmentHeader>() {
            return Err(KernelError::BadElf);
        }
        let table_len = phdr_size
            .checked_mul(count)
            .ok_or(KernelError::BadElf)?;
        let phdr = img
            .get(phdr_off..phdr_off + table_len)
            .ok_or(KernelError::BadElf)?;
        Ok(Self {
            phdr,
            phdr_size,
            count,
        })
    }

    /// Number of program headers.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Reads program header `idx`.
    pub fn segment(&self, idx: usize) -> SegmentHeader {
        let off = idx * self.phdr_size;
        let bytes = &self.phdr[off..off + core::mem::size_of::<SegmentHeader>()];
        // SAFETY: the slice is in bounds and SegmentHeader is plain data;
        // read_unaligned tolerates the byte-granular offset.
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const SegmentHeader) }
    }

    /// Iterates over the PT_LOAD segments.
    pub fn load_segments(&self) -> impl Iterator<Item = SegmentHeader> + '_ {
        (0..self.count)
            .map(|i| self.segment(i))
            .filter(|s| s.p_type == PT_LOAD)
    }
}
