//! Trap entry and exit paths
//!
//! One stub per gate. Each stub makes the stack look the same whether or
//! not the hardware pushed an error code, pushes its vector, and jumps to
//! `alltraps`, which saves the general registers and calls
//! [`trap_entry`](crate::ke::trap::trap_entry) with a pointer to the
//! resulting [`TrapFrame`].
//!
//! `__trap_entries` pairs each vector with its stub and is laid out in the
//! order of [`GATES`](super::idt::GATES).

use core::arch::{asm, global_asm};

use super::context::TrapFrame;
use super::idt::GATE_COUNT;

global_asm!(
    r#"
.macro TRAPHANDLER name, num
    .globl \name
    .type \name, @function
    .balign 16
\name:
    push \num
    jmp alltraps
.endm

.macro TRAPHANDLER_NOEC name, num
    .globl \name
    .type \name, @function
    .balign 16
\name:
    push 0
    push \num
    jmp alltraps
.endm

.section .text

TRAPHANDLER_NOEC trap_divide, 0
TRAPHANDLER_NOEC trap_debug, 1
TRAPHANDLER_NOEC trap_nmi, 2
TRAPHANDLER_NOEC trap_brkpt, 3
TRAPHANDLER_NOEC trap_oflow, 4
TRAPHANDLER_NOEC trap_bound, 5
TRAPHANDLER_NOEC trap_illop, 6
TRAPHANDLER_NOEC trap_device, 7
TRAPHANDLER      trap_dblflt, 8
TRAPHANDLER      trap_tss, 10
TRAPHANDLER      trap_segnp, 11
TRAPHANDLER      trap_stack, 12
TRAPHANDLER      trap_gpflt, 13
TRAPHANDLER      trap_pgflt, 14
TRAPHANDLER_NOEC trap_fperr, 16
TRAPHANDLER      trap_align, 17
TRAPHANDLER_NOEC trap_mchk, 18
TRAPHANDLER_NOEC trap_simderr, 19
TRAPHANDLER_NOEC trap_syscall, 48
TRAPHANDLER_NOEC irq_timer, 32
TRAPHANDLER_NOEC irq_kbd, 33
TRAPHANDLER_NOEC irq_serial, 36
TRAPHANDLER_NOEC irq_spurious, 39
TRAPHANDLER_NOEC irq_ide, 46
TRAPHANDLER_NOEC irq_error, 51

.balign 16
alltraps:
    cld
    push rax
    push rbx
    push rcx
    push rdx
    push rbp
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    mov rdi, rsp
    call trap_entry
    ud2

.section .rodata
.balign 8
.globl __trap_entries
__trap_entries:
    .quad 0, trap_divide
    .quad 1, trap_debug
    .quad 2, trap_nmi
    .quad 3, trap_brkpt
    .quad 4, trap_oflow
    .quad 5, trap_bound
    .quad 6, trap_illop
    .quad 7, trap_device
    .quad 8, trap_dblflt
    .quad 10, trap_tss
    .quad 11, trap_segnp
    .quad 12, trap_stack
    .quad 13, trap_gpflt
    .quad 14, trap_pgflt
    .quad 16, trap_fperr
    .quad 17, trap_align
    .quad 18, trap_mchk
    .quad 19, trap_simderr
    .quad 48, trap_syscall
    .quad 32, irq_timer
    .quad 33, irq_kbd
    .quad 36, irq_serial
    .quad 39, irq_spurious
    .quad 46, irq_ide
    .quad 51, irq_error

.section .text
"#
);

extern "C" {
    static __trap_entries: [[u64; 2]; GATE_COUNT];
}

/// `(vector, stub address)` pairs in [`GATES`] order
pub fn trap_entries() -> &'static [[u64; 2]] {
    // SAFETY: the table is immutable data emitted above
    unsafe { &*core::ptr::addr_of!(__trap_entries) }
}

/// Restore `tf` and return to the code it describes
///
/// # Safety
/// `tf` must be a complete frame for user mode (or for the interrupted
/// kernel code), and nothing on the current stack may be needed again.
pub unsafe fn pop_tf(tf: &TrapFrame) -> ! {
    unsafe {
        asm!(
            "mov rsp, {tf}",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rdi",
            "pop rsi",
            "pop rbp",
            "pop rdx",
            "pop rcx",
            "pop rbx",
            "pop rax",
            // skip trapno and err
            "add rsp, 16",
            "iretq",
            tf = in(reg) tf as *const TrapFrame,
            options(noreturn),
        )
    }
}

/// Reset the stack to `stack_top`, enable interrupts and halt
///
/// The next interrupt enters the kernel through a fresh trap frame at the
/// top of the same stack; nothing below it is ever returned to.
///
/// # Safety
/// `stack_top` must be this CPU's kernel stack top (TSS `rsp0`).
pub unsafe fn idle(stack_top: u64) -> ! {
    unsafe {
        asm!(
            "mov rbp, 0",
            "mov rsp, {top}",
            "push 0",
            "push 0",
            "sti",
            "2:",
            "hlt",
            "jmp 2b",
            top = in(reg) stack_top,
            options(noreturn),
        )
    }
}
