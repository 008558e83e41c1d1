//! Hardware entry trampolines and context switch primitives.
//!
//! Every trap and the SYSCALL instruction land here first. The trampolines
//! save the full register file into the current thread structure, located
//! through the GS base, then continue on a kernel-owned stack. The numeric
//! offsets below are the layout of `thread::Thread`; `thread.rs` carries
//! compile-time assertions that keep the two in sync.
//!
//! Trap vectors are installed as trap gates, so IF is untouched by the
//! hardware on entry; each trampoline clears it in its first instruction.
//!
//! Thread field offsets from GS base:
//!   0x00 self    0x08 ip     0x10 sp     0x18 flags  0x20 bp
//!   0x28 ax      0x30 bx     0x38 cx     0x40 dx     0x48 si
//!   0x50 di      0x58 r8     0x60 r9     0x68 r10    0x70 r11
//!   0x78 r12     0x80 r13    0x88 r14    0x90 r15    0x98 fsbase
//!   0xA0 fpstate (512 bytes, 16-byte aligned)

use core::arch::global_asm;

global_asm!(
    r#"
// Saves the register file into the current thread through GS. The iretq
// frame is at [rsp]: rip, cs, rflags, rsp, ss. Clobbers rax last so it can
// shuttle the frame values.
.macro SAVE_CTX frame_off
    mov qword ptr gs:[0x28], rax
    mov qword ptr gs:[0x30], rbx
    mov qword ptr gs:[0x38], rcx
    mov qword ptr gs:[0x40], rdx
    mov qword ptr gs:[0x48], rsi
    mov qword ptr gs:[0x50], rdi
    mov qword ptr gs:[0x20], rbp
    mov qword ptr gs:[0x58], r8
    mov qword ptr gs:[0x60], r9
    mov qword ptr gs:[0x68], r10
    mov qword ptr gs:[0x70], r11
    mov qword ptr gs:[0x78], r12
    mov qword ptr gs:[0x80], r13
    mov qword ptr gs:[0x88], r14
    mov qword ptr gs:[0x90], r15
    mov rax, [rsp + \frame_off + 0]
    mov qword ptr gs:[0x08], rax
    mov rax, [rsp + \frame_off + 16]
    mov qword ptr gs:[0x18], rax
    mov rax, [rsp + \frame_off + 24]
    mov qword ptr gs:[0x10], rax
    mov rax, gs:[0x00]
    fxsave64 [rax + 0xA0]
.endm

// SYSCALL entry. The CPU put the return RIP in RCX and RFLAGS in R11; the
// flag mask already cleared IF. Saves state, moves to the kernel stack and
// dispatches. sysenter() resumes the thread itself and never returns here.
.global syscall_trampoline
syscall_trampoline:
    mov qword ptr gs:[0x08], rcx
    mov qword ptr gs:[0x18], r11
    mov qword ptr gs:[0x10], rsp
    mov qword ptr gs:[0x28], rax
    mov qword ptr gs:[0x30], rbx
    mov qword ptr gs:[0x38], rcx
    mov qword ptr gs:[0x40], rdx
    mov qword ptr gs:[0x48], rsi
    mov qword ptr gs:[0x50], rdi
    mov qword ptr gs:[0x20], rbp
    mov qword ptr gs:[0x58], r8
    mov qword ptr gs:[0x60], r9
    mov qword ptr gs:[0x68], r10
    mov qword ptr gs:[0x70], r11
    mov qword ptr gs:[0x78], r12
    mov qword ptr gs:[0x80], r13
    mov qword ptr gs:[0x88], r14
    mov qword ptr gs:[0x90], r15
    mov rsp, [rip + KERNEL_STACK_TOP]
    mov rdi, gs:[0x00]
    call sysenter
    ud2

// HPET timer. Reschedules; never returns.
.global timer_trampoline
timer_trampoline:
    cli
    SAVE_CTX 0
    mov rsp, [rip + KERNEL_STACK_TOP]
    call timer_interrupt
    ud2

// Page fault, running on its own interrupt stack (IST2). The handler
// returns for recoverable lazy-commit faults; everything else is fatal.
.global page_fault_trampoline
page_fault_trampoline:
    cli
    SAVE_CTX 8
    mov rdi, [rsp]
    mov rsi, cr2
    call page_fault_interrupt
    jmp resume_thread

.global gp_trampoline
gp_trampoline:
    cli
    SAVE_CTX 8
    mov rdi, [rsp]
    mov rsp, [rip + KERNEL_STACK_TOP]
    call gp_fault
    ud2

.global div_trampoline
div_trampoline:
    cli
    SAVE_CTX 0
    mov rsp, [rip + KERNEL_STACK_TOP]
    call div_fault
    ud2

.global sse_trampoline
sse_trampoline:
    cli
    SAVE_CTX 0
    mov rsp, [rip + KERNEL_STACK_TOP]
    call sse_fault
    ud2

.global unknown_int_trampoline
unknown_int_trampoline:
    cli
    SAVE_CTX 0
    mov rsp, [rip + KERNEL_STACK_TOP]
    call unknown_interrupt
    ud2

// Device (MSI) vectors. These only record the interrupt and acknowledge
// the APIC; the blocked thread is picked up at the next scheduling point.
// All scratch registers are preserved so the interrupted context continues
// untouched.
.macro USER_INTR idx
.global user_intr_trampoline_\idx
user_intr_trampoline_\idx:
    cli
    push rax
    push rcx
    push rdx
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    mov rdi, \idx
    call user_interrupt
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rax
    iretq
.endm

USER_INTR 0
USER_INTR 1
USER_INTR 2
USER_INTR 3
USER_INTR 4
USER_INTR 5
USER_INTR 6
USER_INTR 7
USER_INTR 8
USER_INTR 9

// Restores the full context of the current thread, including the FPU
// state, and resumes it with an iretq (selectors 0x08/0x10 are the ring-0
// code and data segments). Never returns.
.global resume_thread
resume_thread:
    mov rcx, gs:[0x00]
    fxrstor64 [rcx + 0xA0]
    push 0x10
    push qword ptr [rcx + 0x10]
    push qword ptr [rcx + 0x18]
    push 0x08
    push qword ptr [rcx + 0x08]
    mov rax, [rcx + 0x28]
    mov rbx, [rcx + 0x30]
    mov rdx, [rcx + 0x40]
    mov rsi, [rcx + 0x48]
    mov rdi, [rcx + 0x50]
    mov rbp, [rcx + 0x20]
    mov r8,  [rcx + 0x58]
    mov r9,  [rcx + 0x60]
    mov r10, [rcx + 0x68]
    mov r11, [rcx + 0x70]
    mov r12, [rcx + 0x78]
    mov r13, [rcx + 0x80]
    mov r14, [rcx + 0x88]
    mov r15, [rcx + 0x90]
    mov rcx, [rcx + 0x38]
    iretq

// Fast resume for the SYSCALL return path: RCX and R11 are clobbered per
// the SYSCALL convention and the FPU state is not restored. The flags are
// reinstated from the saved context via popfq; the one-instruction window
// with IF set before the jmp is safe because a trap there saves and later
// re-executes only the jmp.
.global resume_thread_fast
resume_thread_fast:
    mov rcx, gs:[0x00]
    mov rax, [rcx + 0x28]
    mov rbx, [rcx + 0x30]
    mov rdx, [rcx + 0x40]
    mov rsi, [rcx + 0x48]
    mov rdi, [rcx + 0x50]
    mov rbp, [rcx + 0x20]
    mov r8,  [rcx + 0x58]
    mov r9,  [rcx + 0x60]
    mov r10, [rcx + 0x68]
    mov r12, [rcx + 0x78]
    mov r13, [rcx + 0x80]
    mov r14, [rcx + 0x88]
    mov r15, [rcx + 0x90]
    mov rsp, [rcx + 0x10]
    mov r11, [rcx + 0x08]
    push qword ptr [rcx + 0x18]
    popfq
    jmp r11

// Snapshots the callee-saved registers and FPU state of the caller into
// the current thread. Used once at boot to seed the initial thread with a
// sane MXCSR before it is first resumed.
.global save_thread
save_thread:
    mov rcx, gs:[0x00]
    mov [rcx + 0x30], rbx
    mov [rcx + 0x20], rbp
    mov [rcx + 0x78], r12
    mov [rcx + 0x80], r13
    mov [rcx + 0x88], r14
    mov [rcx + 0x90], r15
    fxsave64 [rcx + 0xA0]
    ret

// Waits for one interrupt with the CPU halted, then returns with
// interrupts disabled again.
.global yield_halt
yield_halt:
    sti
    hlt
    cli
    ret
"#
);

extern "C" {
    /// Restores the current thread completely (registers and FPU) and
    /// resumes it. Never returns.
    pub fn resume_thread() -> !;

    /// Resumes the current thread along the SYSCALL return convention:
    /// RCX/R11 are clobbered, the FPU state is left alone. Never returns.
    pub fn resume_thread_fast() -> !;

    /// Saves callee-saved registers and FPU state into the current thread.
    pub fn save_thread();

    /// Halts until the next interrupt arrives.
    pub fn yield_halt();

    pub fn syscall_trampoline();
    pub fn timer_trampoline();
    pub fn page_fault_trampoline();
    pub fn gp_trampoline();
    pub fn div_trampoline();
    pub fn sse_trampoline();
    pub fn unknown_int_trampoline();
    pub fn user_intr_trampoline_0();
    pub fn user_intr_trampoline_1();
    pub fn user_intr_trampoline_2();
    pub fn user_intr_trampoline_3();
    pub fn user_intr_trampoline_4();
    pub fn user_intr_trampoline_5();
    pub fn user_intr_trampoline_6();
    pub fn user_intr_trampoline_7();
    pub fn user_intr_trampoline_8();
    pub fn user_intr_trampoline_9();
}
