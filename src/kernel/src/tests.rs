//! Kernel-level tests.
//!
//! Run by the initial user thread right after boot, so the syscall-level
//! cases exercise the real trap, scheduling and paging machinery while the
//! data-structure cases run against fresh instances. Results are logged to
//! serial output.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;

use x86_64::structures::paging::PageTableFlags;

use ydin_sdk as sdk;
use ydin_virtio::{
    input::{Event, ABS_X, ABS_Y, EV_ABS, EV_SYN},
    Commander, IoRegion, PhysBlock, Queue, Reader, SplitQueue, UsedElem,
};

use crate::mem::bitmap::FrameBitmap;
use crate::mem::ranges::{MemoryRange, VirtRanges};
use crate::mem::{elf::ElfImage, PAGE_SIZE};
use crate::serial_println;

/// Runs all kernel tests.
pub fn run_all() {
    serial_println!("[test] Running kernel tests...");

    test_frame_bitmap_set_free();
    test_frame_bitmap_alloc_disjoint();
    test_frame_bitmap_boot_layout();
    test_virt_ranges_ordering();
    test_virt_ranges_fixed();
    test_elf_parsing();
    test_civil_days();
    test_page_table_integrity();
    test_demand_paging();
    test_vdso_monotonic();
    test_nanosleep_deadline();
    test_clone_and_futex();
    test_commander_conservation();
    test_reader_event_stream();

    serial_println!("[test] All kernel tests passed!");
}

const PAGE: u64 = PAGE_SIZE as u64;

/// Exhaustively checks `set_free` against a naive model over a two-word
/// bitmap, covering every start/end combination including the word
/// boundaries where an aligned end bit selects no end-word bits at all.
fn test_frame_bitmap_set_free() {
    serial_println!("[test] frame_bitmap_set_free... ");
    const WORDS: usize = 2;
    const PAGES: u64 = WORDS as u64 * 64;
    let mut backing = alloc::vec![0u64; WORDS];
    // SAFETY: backing outlives the bitmap.
    let mut bm = unsafe { FrameBitmap::from_raw(backing.as_mut_ptr(), WORDS, 0) };
    for start in 0..=PAGES {
        for end in start..=PAGES {
            bm.set_free(true, 0, PAGES * PAGE);
            bm.set_free(false, start * PAGE, end * PAGE);
            for p in 0..PAGES {
                let expect_free = !(start <= p && p < end);
                assert_eq!(bm.is_free(p * PAGE), expect_free, "reserve [{start}, {end}) page {p}");
            }
            bm.set_free(false, 0, PAGES * PAGE);
            bm.set_free(true, start * PAGE, end * PAGE);
            for p in 0..PAGES {
                let expect_free = start <= p && p < end;
                assert_eq!(bm.is_free(p * PAGE), expect_free, "free [{start}, {end}) page {p}");
            }
        }
    }
    serial_println!("[test] frame_bitmap_set_free... ok");
}

/// Allocations never overlap until something is freed.
fn test_frame_bitmap_alloc_disjoint() {
    serial_println!("[test] frame_bitmap_alloc_disjoint... ");
    const WORDS: usize = 2;
    const PAGES: u64 = WORDS as u64 * 64;
    let mut backing = alloc::vec![0u64; WORDS];
    // SAFETY: backing outlives the bitmap.
    let mut bm = unsafe { FrameBitmap::from_raw(backing.as_mut_ptr(), WORDS, 0) };
    bm.set_free(true, 0, PAGES * PAGE);

    let mut got: Vec<(u64, usize)> = Vec::new();
    while let Some((addr, size)) = bm.alloc(3 * PAGE_SIZE) {
        for &(a, s) in &got {
            let disjoint = addr + size as u64 <= a || a + s as u64 <= addr;
            assert!(disjoint, "[{addr:#x}+{size:#x}) overlaps [{a:#x}+{s:#x})");
        }
        got.push((addr, size));
    }
    let total: usize = got.iter().map(|&(_, s)| s).sum();
    assert_eq!(total as u64, PAGES * PAGE);

    // Freeing returns the pages to the pool.
    let (addr, size) = got[0];
    bm.set_free(true, addr, addr + size as u64);
    assert!(bm.alloc(PAGE_SIZE).is_some());
    serial_println!("[test] frame_bitmap_alloc_disjoint... ok");
}

/// The firmware-map shape at boot: loader data reserved, conventional
/// memory free, the bitmap's own pages carved out, and the first
/// allocation landing past all of it.
fn test_frame_bitmap_boot_layout() {
    serial_println!("[test] frame_bitmap_boot_layout... ");
    let min = 0x1000u64;
    let max = 0x1000_0000u64;
    let pages = (max - min) / PAGE;
    let words = ((pages + 63) / 64) as usize;
    let mut backing = alloc::vec![0u64; words];
    // SAFETY: backing outlives the bitmap.
    let mut bm = unsafe { FrameBitmap::from_raw(backing.as_mut_ptr(), words, min) };
    // Conventional memory is free; the loader-data region [0x1000,
    // 0x100000) stays reserved while the memory map lives there.
    bm.set_free(true, 0x10_0000, max);
    // The bitmap itself occupies the head of the conventional region.
    let bitmap_bytes = (pages + 7) / 8;
    let bitmap_pages = (bitmap_bytes + PAGE - 1) / PAGE;
    bm.set_free(false, 0x10_0000, 0x10_0000 + bitmap_pages * PAGE);

    let (addr, size) = bm.alloc(PAGE_SIZE).expect("allocation failed");
    assert_eq!(size, PAGE_SIZE);
    assert!(addr >= 0x10_0000 + bitmap_pages * PAGE && addr < max);
    assert!(!bm.is_free(addr));
    serial_println!("[test] frame_bitmap_boot_layout... ok");
}

/// Ordering and lookup invariants of the range map: `closest_range`
/// agrees with a linear scan, lookups hit iff covered, reservations never
/// overlap.
fn test_virt_ranges_ordering() {
    serial_println!("[test] virt_ranges_ordering... ");
    let mut backing: Vec<MemoryRange> = Vec::with_capacity(64);
    // SAFETY: the backing vector's buffer outlives the map.
    let mut vm = unsafe { VirtRanges::from_raw(backing.as_mut_ptr(), 64) };
    let flags = PageTableFlags::WRITABLE;

    let a = vm.mmap(0, 2 * PAGE, flags).expect("first mmap");
    let b = vm.mmap(0, 2 * PAGE, flags).expect("second mmap");
    assert_ne!(a, b);
    assert!(a + 2 * PAGE <= b || b + 2 * PAGE <= a);
    vm.must_add(0x40_0000, 0x41_0000, flags);
    vm.must_add(0x20_0000, 0x21_0000, flags);

    // Sorted, disjoint.
    let ranges = vm.ranges();
    for w in ranges.windows(2) {
        assert!(w[0].end <= w[1].start);
    }
    // Binary search matches the naive definition.
    for probe in [0u64, a, a + 1, b, 0x20_0000, 0x20_FFFF, 0x41_0000, 0x50_0000] {
        let naive = ranges.iter().position(|r| r.end > probe).unwrap_or(ranges.len());
        assert_eq!(vm.closest_range(probe), naive, "probe {probe:#x}");
    }
    // Covered iff some range contains the address.
    for probe in [a, b + PAGE, 0x20_0000, 0x40_FFFF] {
        assert!(vm.range_for(probe, 1).is_some());
    }
    for probe in [0u64, 0x21_0000, 0x7F_0000] {
        assert!(vm.range_for(probe, 1).is_none());
    }
    serial_println!("[test] virt_ranges_ordering... ok");
}

fn test_virt_ranges_fixed() {
    serial_println!("[test] virt_ranges_fixed... ");
    let mut backing: Vec<MemoryRange> = Vec::with_capacity(16);
    // SAFETY: the backing vector's buffer outlives the map.
    let mut vm = unsafe { VirtRanges::from_raw(backing.as_mut_ptr(), 16) };
    let flags = PageTableFlags::WRITABLE;
    assert!(vm.mmap_fixed(0x30_0000, 4 * PAGE, flags));
    // Overlap in any position is rejected.
    assert!(!vm.mmap_fixed(0x30_0000, PAGE, flags));
    assert!(!vm.mmap_fixed(0x30_2000, 4 * PAGE, flags));
    assert!(!vm.mmap_fixed(0x2F_F000, 2 * PAGE, flags));
    // Unaligned addresses are rejected outright.
    assert!(!vm.mmap_fixed(0x30_0800, PAGE, flags));
    // Adjacent is fine.
    assert!(vm.mmap_fixed(0x30_4000, PAGE, flags));
    serial_println!("[test] virt_ranges_fixed... ok");
}

fn test_elf_parsing() {
    serial_println!("[test] elf_parsing... ");
    const PHOFF: usize = 64;
    const PHENT: usize = 56;
    let mut img = alloc::vec![0u8; PHOFF + 2 * PHENT];
    img[0..4].copy_from_slice(&0x464C_457Fu32.to_le_bytes());
    img[32..40].copy_from_slice(&(PHOFF as u64).to_le_bytes());
    img[54..56].copy_from_slice(&(PHENT as u16).to_le_bytes());
    img[56..58].copy_from_slice(&2u16.to_le_bytes());
    // Segment 0: PT_LOAD, R+X, 0x1234 bytes at 0x20_0000, 4 KiB aligned.
    let s = PHOFF;
    img[s..s + 4].copy_from_slice(&1u32.to_le_bytes());
    img[s + 4..s + 8].copy_from_slice(&0x5u32.to_le_bytes());
    img[s + 16..s + 24].copy_from_slice(&0x20_0000u64.to_le_bytes());
    img[s + 40..s + 48].copy_from_slice(&0x1234u64.to_le_bytes());
    img[s + 48..s + 56].copy_from_slice(&0x1000u64.to_le_bytes());
    // Segment 1: PT_NOTE, ignored.
    let s = PHOFF + PHENT;
    img[s..s + 4].copy_from_slice(&4u32.to_le_bytes());

    let elf = ElfImage::new(&img).expect("parse failed");
    assert_eq!(elf.count(), 2);
    let loads: Vec<_> = elf.load_segments().collect();
    assert_eq!(loads.len(), 1);
    let seg = &loads[0];
    assert_eq!(seg.start(), 0x20_0000);
    assert_eq!(seg.end(), 0x20_2000);
    let flags = seg.page_flags();
    assert!(!flags.contains(PageTableFlags::NO_EXECUTE));
    assert!(!flags.contains(PageTableFlags::WRITABLE));

    // A bad magic is rejected.
    let mut bad = img.clone();
    bad[0] = 0;
    assert!(ElfImage::new(&bad).is_err());
    serial_println!("[test] elf_parsing... ok");
}

fn test_civil_days() {
    serial_println!("[test] civil_days... ");
    assert_eq!(crate::clock::days_from_civil(1970, 1, 1), 0);
    assert_eq!(crate::clock::days_from_civil(1969, 12, 31), -1);
    assert_eq!(crate::clock::days_from_civil(2000, 3, 1), 11017);
    assert_eq!(crate::clock::days_from_civil(2038, 1, 19), 24855);
    serial_println!("[test] civil_days... ok");
}

/// A full walk of the live page tables: no two mappings below the
/// physical map may target the same physical page.
fn test_page_table_integrity() {
    serial_println!("[test] page_table_integrity... ");
    assert!(crate::mem::verify_page_tables());
    serial_println!("[test] page_table_integrity... ok");
}

/// Anonymous mappings are distinct, and each page materializes on first
/// touch with the written bytes surviving.
fn test_demand_paging() {
    serial_println!("[test] demand_paging... ");
    let a = sdk::mmap_anon(2 * PAGE_SIZE).expect("mmap a");
    let b = sdk::mmap_anon(2 * PAGE_SIZE).expect("mmap b");
    assert_ne!(a, b);
    let (a_addr, b_addr) = (a as u64, b as u64);
    assert!(a_addr + 2 * PAGE <= b_addr || b_addr + 2 * PAGE <= a_addr);
    for (i, region) in [a, b].into_iter().enumerate() {
        for page in 0..2 {
            // SAFETY: inside the fresh mapping.
            unsafe {
                let p = region.add(page * PAGE_SIZE);
                p.write_bytes(0xA0 + i as u8 + page as u8, PAGE_SIZE);
                assert_eq!(p.read(), 0xA0 + i as u8 + page as u8);
                assert_eq!(p.add(PAGE_SIZE - 1).read(), 0xA0 + i as u8 + page as u8);
                // Second touch must not change anything.
                p.write(0x55);
                assert_eq!(p.read(), 0x55);
            }
        }
    }
    serial_println!("[test] demand_paging... ok");
}

/// Two vDSO reads across a timer tick never go backwards and never tear.
fn test_vdso_monotonic() {
    serial_println!("[test] vdso_monotonic... ");
    let (s1, u1) = sdk::gettimeofday();
    sdk::nanosleep(Duration::from_millis(15));
    let (s2, u2) = sdk::gettimeofday();
    assert!(u1 < 1_000_000 && u2 < 1_000_000);
    assert!((s2, u2) >= (s1, u1), "clock went backwards");
    serial_println!("[test] vdso_monotonic... ok");
}

fn now_millis() -> i64 {
    let (s, u) = sdk::gettimeofday();
    s * 1_000 + u / 1_000
}

/// nanosleep resumes at or after its deadline, within scheduler-tick
/// slack.
fn test_nanosleep_deadline() {
    serial_println!("[test] nanosleep_deadline... ");
    let t0 = now_millis();
    sdk::nanosleep(Duration::from_millis(100));
    let elapsed = now_millis() - t0;
    assert!(elapsed >= 90, "slept only {elapsed} ms");
    assert!(elapsed < 2_000, "slept {elapsed} ms");
    serial_println!("[test] nanosleep_deadline... ok");
}

static FUTEX_WORD: AtomicU32 = AtomicU32::new(0);

extern "C" fn futex_child(_arg: u64) -> ! {
    sdk::nanosleep(Duration::from_millis(20));
    FUTEX_WORD.store(1, Ordering::Release);
    sdk::futex_wake(&FUTEX_WORD, 1);
    // This thread's work is done; park it forever.
    loop {
        sdk::nanosleep(Duration::from_secs(3600));
    }
}

/// clone creates a runnable sibling and futex wake reaches a waiting
/// thread within scheduler latency.
fn test_clone_and_futex() {
    serial_println!("[test] clone_and_futex... ");
    FUTEX_WORD.store(0, Ordering::Release);
    let tid = sdk::thread::spawn(futex_child, 0, 64 * 1024).expect("spawn failed");
    assert!(tid > 0);
    let t0 = now_millis();
    while FUTEX_WORD.load(Ordering::Acquire) == 0 {
        sdk::futex_wait(&FUTEX_WORD, 0, Some(Duration::from_millis(50)));
        assert!(now_millis() - t0 < 2_000, "futex wake never arrived");
    }
    serial_println!("[test] clone_and_futex... ok");
}

/// Fabricates a queue in ordinary memory so the ring logic can run with
/// this test acting as the device.
fn fabricate_queue(storage: &mut Vec<u64>, size: u16, doorbell: *mut u16) -> Queue {
    storage.resize(core::mem::size_of::<SplitQueue>() / 8, 0);
    let ptr = storage.as_mut_ptr() as *mut SplitQueue;
    // SAFETY: the storage is zeroed, 8-byte aligned and outlives the
    // queue; no real device sees it.
    unsafe { Queue::new(ptr, size, doorbell, 0, None) }
}

/// Descriptor conservation: free + in-flight equals the queue size at
/// every quiescent point, across command, completion and read.
fn test_commander_conservation() {
    serial_println!("[test] commander_conservation... ");
    let mut storage: Vec<u64> = Vec::new();
    let mut doorbell: u16 = 0;
    let q = fabricate_queue(&mut storage, 128, &mut doorbell);
    let layout = storage.as_mut_ptr() as *mut SplitQueue;
    let mut c = Commander::new(q);
    assert_eq!(c.free_descriptors(), 128);

    let mut req_buf = alloc::vec![0u8; 64];
    let mut resp_buf = alloc::vec![0u8; 16];
    // SAFETY: fabricated regions; only this test dereferences anything.
    let req = unsafe {
        IoRegion::from_raw(
            req_buf.as_mut_ptr(),
            64,
            alloc::vec![
                PhysBlock { addr: 0x1000, size: 32 },
                PhysBlock { addr: 0x2000, size: 32 },
            ],
        )
    };
    let resp = unsafe {
        IoRegion::from_raw(
            resp_buf.as_mut_ptr(),
            16,
            alloc::vec![PhysBlock { addr: 0x3000, size: 16 }],
        )
    };

    assert!(c.command(&req, &resp));
    assert_eq!(c.free_descriptors(), 128 - 3);

    // Act as the device: complete the chain.
    // SAFETY: the ring block belongs to this test.
    unsafe {
        let head = core::ptr::read_volatile(core::ptr::addr_of!((*layout).available.ring[0]));
        core::ptr::write_volatile(
            core::ptr::addr_of_mut!((*layout).used.ring[0]),
            UsedElem {
                id: head as u32,
                len: 16,
            },
        );
        core::ptr::write_volatile(core::ptr::addr_of_mut!((*layout).used.idx), 1u16);
    }
    // Everything submitted has been consumed.
    c.sync();
    assert_eq!(c.read(), 1);
    assert_eq!(c.free_descriptors(), 128);
    serial_println!("[test] commander_conservation... ok");
}

/// An event stream read back in awkward chunk sizes still yields every
/// record once, in order.
fn test_reader_event_stream() {
    serial_println!("[test] reader_event_stream... ");
    const QSIZE: u16 = 8;
    const ESIZE: usize = core::mem::size_of::<Event>();
    let mut storage: Vec<u64> = Vec::new();
    let mut doorbell: u16 = 0;
    let q = fabricate_queue(&mut storage, QSIZE, &mut doorbell);
    let layout = storage.as_mut_ptr() as *mut SplitQueue;

    let mut buffer = alloc::vec![0u8; QSIZE as usize * ESIZE];
    let buf_ptr = buffer.as_mut_ptr();
    // SAFETY: fabricated region; the "device" below is this test writing
    // through buf_ptr.
    let region = unsafe {
        IoRegion::from_raw(
            buf_ptr,
            buffer.len(),
            alloc::vec![PhysBlock {
                addr: buf_ptr as u64,
                size: buffer.len(),
            }],
        )
    };
    let mut reader = Reader::new(q, region, ESIZE).expect("reader setup");

    let events = [
        Event { kind: EV_ABS, code: ABS_X, value: 100 },
        Event { kind: EV_ABS, code: ABS_Y, value: 200 },
        Event { kind: EV_SYN, code: 0, value: 0 },
    ];
    // Act as the device: deposit one event per descriptor and publish
    // three used entries.
    // SAFETY: the buffers and rings belong to this test.
    unsafe {
        for (i, ev) in events.iter().enumerate() {
            core::ptr::write_unaligned(buf_ptr.add(i * ESIZE) as *mut Event, *ev);
            core::ptr::write_volatile(
                core::ptr::addr_of_mut!((*layout).used.ring[i]),
                UsedElem {
                    id: i as u32,
                    len: ESIZE as u32,
                },
            );
        }
        core::ptr::write_volatile(core::ptr::addr_of_mut!((*layout).used.idx), 3u16);
    }

    // Drain with deliberately misaligned chunk sizes: 4, then 12, then 8.
    let mut out = [0u8; 3 * ESIZE];
    let mut filled = 0usize;
    for chunk in [4usize, 12, 8] {
        let n = reader
            .read(&mut out[filled..filled + chunk])
            .expect("reader read");
        filled += n;
    }
    assert_eq!(filled, 3 * ESIZE);
    for (i, ev) in events.iter().enumerate() {
        // SAFETY: out holds exactly three records.
        let got = unsafe { core::ptr::read_unaligned(out.as_ptr().add(i * ESIZE) as *const Event) };
        assert_eq!(got, *ev, "event {i}");
    }
    serial_println!("[test] reader_event_stream... ok");
}
