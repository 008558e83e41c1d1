#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(ydin_kernel::testutil::test_runner)]
#![reexport_test_harness_main = "test_main"]

//! Smoke tests that run without the boot protocol: only freestanding data
//! structures, no firmware memory map.

use core::panic::PanicInfo;

use ydin_kernel::mem::bitmap::FrameBitmap;
use ydin_kernel::testutil::{exit_qemu, QemuExitCode};

#[no_mangle]
pub extern "C" fn _start() -> ! {
    ydin_kernel::init();
    test_main();
    exit_qemu(QemuExitCode::Success);
    ydin_kernel::arch::x86_64::halt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    ydin_kernel::testutil::test_panic_handler(info)
}

#[test_case]
fn trivial_assertion() {
    assert_eq!(1, 1);
}

static mut BITMAP_WORDS: [u64; 2] = [0; 2];

#[test_case]
fn bitmap_mark_and_alloc() {
    // SAFETY: the static backing is used by this test only.
    let mut bm =
        unsafe { FrameBitmap::from_raw(core::ptr::addr_of_mut!(BITMAP_WORDS) as *mut u64, 2, 0) };
    bm.set_free(true, 0, 128 * 4096);
    let (addr, size) = bm.alloc(4096).expect("allocation failed");
    assert_eq!(addr, 0);
    assert_eq!(size, 4096);
    assert!(!bm.is_free(addr));
    let (addr2, _) = bm.alloc(4096).expect("allocation failed");
    assert_ne!(addr, addr2);
}
