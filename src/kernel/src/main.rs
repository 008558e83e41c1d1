//! Ydin boot entry and initial runtime payload.
//!
//! The UEFI loader jumps to `_start` with the firmware memory map, the
//! descriptor stride and the kernel's own ELF image in the SysV argument
//! registers. Boot brings up memory, traps, the syscall surface, threads
//! and the clock, then resumes the first user thread with Linux-style
//! process state on its stack.

#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use core::arch::global_asm;
use core::panic::PanicInfo;
use core::time::Duration;

use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};
use x86_64::structures::paging::PageTableFlags;

use ydin_kernel::arch::x86_64::{gdt, interrupts, serial, trampolines};
use ydin_kernel::boot::{self, Status};
use ydin_kernel::mem::{self, EfiMemoryMap, KernelImage};
use ydin_kernel::{allocator, clock, fatal_error, serial_println, syscall, thread, vdso};

use ydin_sdk as sdk;
use ydin_sdk::sync::EventQueue;
use ydin_virtio::gpu::Gpu;
use ydin_virtio::input::{Event, Input, ABS_X};

global_asm!(
    r#"
// Loader entry. Arguments arrive in the SysV registers and are passed
// through untouched to kernel_entry: memory-map pointer and length, the
// descriptor stride, and the kernel image pointer and length.
.global _start
_start:
    cli
    lea rsp, [rip + KERNEL_STACK]
    add rsp, 40960
    and rsp, -16
    call kernel_entry
    ud2
"#
);

#[no_mangle]
extern "C" fn kernel_entry(
    mmap_ptr: *const u8,
    mmap_len: usize,
    desc_stride: usize,
    image_ptr: *const u8,
    image_len: usize,
) -> ! {
    ydin_kernel::init();
    serial_println!("Ydin starting");

    // FXSAVE and SSE exception plumbing before any FPU state is saved.
    // SAFETY: this is the canonical long-mode CR4 configuration for this
    // kernel; paging stays enabled throughout.
    unsafe {
        Cr4::write(
            Cr4Flags::PHYSICAL_ADDRESS_EXTENSION
                | Cr4Flags::PAGE_SIZE_EXTENSION
                | Cr4Flags::DEBUGGING_EXTENSIONS
                | Cr4Flags::OSFXSR
                | Cr4Flags::OSXMMEXCPT_ENABLE,
        );
        // FXSAVE/FXRSTOR must never take a device-not-available fault.
        Cr0::update(|f| f.remove(Cr0Flags::TASK_SWITCHED));
    }

    gdt::init();
    boot::log(Status::Ok, "GDT and TSS loaded");
    // Traps may fire from here on; give them a context to save into.
    thread::init_boot_thread();

    // SAFETY: the loader contract hands us these exact buffers.
    let mut efi_map = unsafe { EfiMemoryMap::from_raw(mmap_ptr, mmap_len, desc_stride) };
    let mut image = unsafe { KernelImage::from_raw(image_ptr, image_len) };

    if let Err(err) = mem::init_memory(&mut efi_map, &mut image) {
        fatal_error("init_memory", err);
    }
    boot::log(Status::Ok, "memory map switched");

    if let Err(err) = interrupts::init() {
        fatal_error("init_interrupts", err);
    }
    boot::log(Status::Ok, "APIC and IDT configured");

    if let Err(err) = allocator::init() {
        fatal_error("init_heap", err);
    }
    boot::log(Status::Ok, "kernel heap reserved");

    syscall::init();
    boot::log(Status::Ok, "SYSCALL entry installed");

    if let Err(err) = vdso::init() {
        fatal_error("init_vdso", err);
    }
    boot::log(Status::Ok, "vDSO page mapped");

    if let Err(err) = thread::init() {
        fatal_error("init_threads", err);
    }
    boot::log(Status::Ok, "thread table reserved");

    if let Err(err) = clock::init() {
        fatal_error("init_clock", err);
    }
    boot::log(Status::Ok, "HPET clock running");

    boot::log(Status::Info, "starting runtime");
    run_user()
}

/// Builds the initial user thread and resumes it into `user_main` with
/// interrupts enabled.
fn run_user() -> ! {
    let stack_size = gdt::STACK_SIZE as u64;
    let flags =
        PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE | PageTableFlags::USER_ACCESSIBLE;
    let stack = match mem::vmap_reserve(0, stack_size, flags) {
        Ok(addr) => addr,
        Err(err) => fatal_error("run_user: stack", err),
    };
    let t = match thread::new_thread() {
        Ok(t) => t,
        Err(err) => fatal_error("run_user: thread", err),
    };
    let top = (stack + stack_size) & !0xF;
    thread::make_current(t);
    // Snapshot a sane FPU/MXCSR state into the fresh context.
    // SAFETY: GS designates t.
    unsafe { trampolines::save_thread() };

    const ENV_SIZE: u64 = 256;
    setup_env(top - ENV_SIZE);
    t.ctx.sp = top - ENV_SIZE;
    t.ctx.flags = syscall::FLAG_RESERVED | syscall::FLAG_IF;
    t.ctx.ip = user_main as usize as u64;
    // SAFETY: the context is fully initialized.
    unsafe { trampolines::resume_thread() }
}

/// Lays out argc/argv/envp/auxv at `base` the way Linux would, which is
/// what the hosted runtime parses on entry.
fn setup_env(base: u64) {
    // SAFETY: base points into the freshly reserved user stack; the
    // stores below fault its pages in.
    unsafe {
        let p = base as *mut u64;
        p.write(1); // argc: the program name only
        let argv0 = p.add(1); // patched below
        p.add(2).write(0); // argv terminator
        p.add(3).write(0); // empty envp
        const AT_PAGESZ: u64 = 6;
        const AT_NULL: u64 = 0;
        p.add(4).write(AT_PAGESZ);
        p.add(5).write(mem::PAGE_SIZE as u64);
        p.add(6).write(AT_NULL);
        p.add(7).write(0);
        let name = p.add(8) as *mut u8;
        argv0.write(name as u64);
        let text = b"ydin\0";
        core::ptr::copy_nonoverlapping(text.as_ptr(), name, text.len());
    }
}

/// The initial user thread: stands in for the hosted runtime. Runs the
/// boot-time test suite when enabled, then probes the virtio devices.
#[no_mangle]
extern "C" fn user_main() -> ! {
    sdk::print("ydin: runtime thread up\n");

    #[cfg(feature = "boot-tests")]
    ydin_kernel::tests::run_all();

    demo_input();
    demo_gpu();

    sdk::print("ydin: done\n");
    sdk::exit()
}

struct InputPump {
    input: Input,
    events: &'static EventQueue<Event>,
}

/// Producer half of the event pipeline: blocks in the device reader and
/// feeds the queue.
extern "C" fn input_pump(arg: u64) -> ! {
    // SAFETY: run_user leaked the pump exclusively to this thread.
    let pump = unsafe { &mut *(arg as *mut InputPump) };
    let mut batch = [Event::default(); 16];
    loop {
        match pump.input.read(&mut batch) {
            Ok(n) => {
                for ev in &batch[..n] {
                    let _ = pump.events.send(*ev);
                }
            }
            Err(_) => sdk::exit(),
        }
    }
}

/// Probes the input device and, when present, drains a short burst of
/// events through the reader thread.
fn demo_input() {
    let input = match Input::open() {
        Ok(input) => input,
        Err(err) => {
            let mut line = alloc::string::String::from("ydin: input unavailable: ");
            line.push_str(&alloc::format!("{}\n", err));
            sdk::print(&line);
            return;
        }
    };
    sdk::print(&alloc::format!("ydin: input device \"{}\"\n", input.name()));
    if let Ok(abs) = input.abs_info(ABS_X) {
        sdk::print(&alloc::format!(
            "ydin: x axis range {}..{}\n",
            abs.min,
            abs.max
        ));
    }

    let events: &'static EventQueue<Event> = Box::leak(Box::new(EventQueue::with_capacity(64)));
    let pump = Box::leak(Box::new(InputPump { input, events }));
    if sdk::thread::spawn(input_pump, pump as *mut InputPump as u64, 64 * 1024).is_err() {
        sdk::print("ydin: input reader thread failed\n");
        return;
    }
    // Report whatever arrives within a short window; an idle device is
    // fine too.
    let mut seen = 0u32;
    for _ in 0..20 {
        while let Some(ev) = events.try_recv() {
            seen += 1;
            let _ = ev;
        }
        sdk::nanosleep(Duration::from_millis(50));
    }
    sdk::print(&alloc::format!("ydin: {} input events\n", seen));
}

/// Cursor bitmap: an opaque white block with a black border, BGRA.
fn cursor_pixels() -> alloc::vec::Vec<u8> {
    let mut pix = alloc::vec![0u8; 64 * 64 * 4];
    for y in 0..64usize {
        for x in 0..64usize {
            let i = (y * 64 + x) * 4;
            let edge = x == 0 || y == 0 || x == 63 || y == 63;
            let v = if edge { 0x00 } else { 0xFF };
            pix[i] = v;
            pix[i + 1] = v;
            pix[i + 2] = v;
            pix[i + 3] = 0xFF;
        }
    }
    pix
}

/// Probes the GPU: scanout query plus a cursor upload, which exercises
/// both queues, 2D resources and the transfer/flush path.
fn demo_gpu() {
    let mut gpu = match Gpu::open() {
        Ok(gpu) => gpu,
        Err(err) => {
            sdk::print(&alloc::format!("ydin: gpu unavailable: {}\n", err));
            return;
        }
    };
    let (width, height) = match gpu.query_scanout() {
        Ok(dims) => dims,
        Err(err) => {
            sdk::print(&alloc::format!("ydin: scanout query failed: {}\n", err));
            return;
        }
    };
    sdk::print(&alloc::format!("ydin: scanout {}x{}\n", width, height));

    match gpu.new_cursor(&cursor_pixels(), 0, 0) {
        Ok(cursor) => {
            gpu.move_cursor(cursor, width / 2, height / 2);
            if let Err(err) = gpu.flush_3d() {
                sdk::print(&alloc::format!("ydin: cursor flush failed: {}\n", err));
            }
        }
        Err(err) => {
            sdk::print(&alloc::format!("ydin: cursor setup failed: {}\n", err));
        }
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial::force_unlock();
    serial_println!("kernel panic: {}", info);
    ydin_kernel::arch::x86_64::halt_loop();
}
