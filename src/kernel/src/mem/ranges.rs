//! Virtual address range map.
//!
//! An ordered sequence of disjoint half-open ranges with page flags. The
//! map backs demand paging: a page fault is recoverable exactly when some
//! range covers the faulting address with flags that permit access.
//!
//! Storage is a slab carved out of a fixed virtual reservation whose first
//! page is mapped eagerly and whose remainder is itself demand-paged, so
//! insertion may fault. Insertion shifts entries tail-first: the very first
//! write touches the new tail slot, so a fault taken mid-shift always
//! observes a fully consistent array.

use x86_64::structures::paging::PageTableFlags;

use crate::error::KernelError;
use crate::mem::PAGE_SIZE;

/// A reserved virtual range and the flags its pages are mapped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
    pub flags: PageTableFlags,
}

impl MemoryRange {
    fn contains_range(&self, addr: u64, size: u64) -> bool {
        self.start <= addr && addr + size <= self.end
    }

    fn overlaps(&self, other: &MemoryRange) -> bool {
        self.start <= other.start && self.end > other.start
            || other.start <= self.start && other.end > self.start
    }
}

/// Aligns an address down to the page size.
pub fn page_align(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Aligns an address up to the page size.
pub fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// The ordered range map.
pub struct VirtRanges {
    ptr: *mut MemoryRange,
    len: usize,
    cap: usize,
    /// Search start for the next anonymous reservation. The low megabyte
    /// stays unmapped so null dereferences keep faulting.
    next: u64,
}

// SAFETY: accessed only through the kernel cell that owns it.
unsafe impl Send for VirtRanges {}

impl VirtRanges {
    pub const fn empty() -> Self {
        Self {
            ptr: core::ptr::null_mut(),
            len: 0,
            cap: 0,
            next: 0x10_0000,
        }
    }

    /// Builds a map over raw slab storage.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for `cap` entries for the lifetime of the map.
    /// The slab may be lazily committed as long as faults on it are
    /// recoverable by the time the map is first mutated.
    pub unsafe fn from_raw(ptr: *mut MemoryRange, cap: usize) -> Self {
        Self {
            ptr,
            len: 0,
            cap,
            next: 0x10_0000,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn ranges(&self) -> &[MemoryRange] {
        // SAFETY: entries 0..len are initialized.
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Reserves a range of `size` bytes, preferring `hint` as the start
    /// address; `hint` zero means anywhere.
    pub fn mmap(
        &mut self,
        hint: u64,
        size: u64,
        flags: PageTableFlags,
    ) -> Result<u64, KernelError> {
        let addr = if hint == 0 { self.next } else { hint };
        let start = page_align(addr);
        let end = page_align_up(addr + size);
        if self.add_range(start, end, flags) {
            return Ok(start);
        }
        // First fit: walk ranges from the search hint and try the gap after
        // each one.
        let mut idx = self.closest_range(self.next);
        while idx < self.len {
            let start = self.ranges()[idx].end;
            let end = page_align_up(start + size);
            if self.add_range(start, end, flags) {
                self.next = end;
                return Ok(start);
            }
            idx += 1;
        }
        Err(KernelError::OutOfMemory)
    }

    /// Reserves `size` bytes exactly at page-aligned `addr`. Returns false
    /// if the address is unaligned or the range overlaps an existing one.
    pub fn mmap_fixed(&mut self, addr: u64, size: u64, flags: PageTableFlags) -> bool {
        if addr != page_align(addr) {
            return false;
        }
        let end = page_align_up(addr + size);
        self.add_range(addr, end, flags)
    }

    /// Like [`add_range`] but panics if the range overlaps.
    pub fn must_add(&mut self, start: u64, end: u64, flags: PageTableFlags) {
        if !self.add_range(start, end, flags) {
            panic!("must_add: adding overlapping range");
        }
    }

    /// Returns the range containing `[addr, addr + size)`, if any.
    pub fn range_for(&self, addr: u64, size: u64) -> Option<MemoryRange> {
        let i = self.closest_range(addr);
        if i >= self.len {
            return None;
        }
        let r = self.ranges()[i];
        if !r.contains_range(addr, size) {
            return None;
        }
        Some(r)
    }

    /// Inserts `[start, end)` keeping the map sorted. Returns false if it
    /// would overlap an existing range.
    pub fn add_range(&mut self, start: u64, end: u64, flags: PageTableFlags) -> bool {
        if start > end {
            panic!("add_range: invalid range");
        }
        if self.len == self.cap {
            return false;
        }
        let i = self.closest_range(start);
        let r = MemoryRange { start, end, flags };
        if i < self.len && self.ranges()[i].overlaps(&r) {
            return false;
        }
        // Shift tail-first; see the module comment for why the order
        // matters.
        let mut j = self.len;
        while j > i {
            // SAFETY: j <= len < cap, entries below j are initialized.
            unsafe { self.ptr.add(j).write(self.ptr.add(j - 1).read()) };
            j -= 1;
        }
        // SAFETY: slot i is ours now.
        unsafe { self.ptr.add(i).write(r) };
        self.len += 1;
        true
    }

    /// Binary search for the lowest index `i` with `ranges[i].end > addr`.
    pub fn closest_range(&self, addr: u64) -> usize {
        let ranges = self.ranges();
        let (mut i, mut j) = (0usize, ranges.len());
        while i < j {
            let h = (i + j) / 2;
            if ranges[h].end <= addr {
                i = h + 1;
            } else {
                j = h;
            }
        }
        i
    }
}
