//! Page-fault upcall trampoline
//!
//! The kernel enters `_pgfault_upcall` on the exception stack with `rsp`
//! pointing at a [`UTrapframe`]:
//!
//! ```text
//!   [rsp +   0]  fault_va
//!   [rsp +   8]  err
//!   [rsp +  16]  r15 ... rax     (15 registers)
//!   [rsp + 136]  rip
//!   [rsp + 144]  rflags
//!   [rsp + 152]  rsp
//! ```
//!
//! After the handler returns, the trampoline pushes the trap-time `rip` into
//! the scratch word below the trap-time stack, restores every register and
//! the flags from the frame, switches to the trap-time stack and `ret`s.

use core::arch::global_asm;

use exo_abi::UTrapframe;

use crate::pgfault::PGFAULT_HANDLER;

const _: () = assert!(UTrapframe::SIZE == 160);

/// Called by the trampoline with the frame on the exception stack
extern "C" fn dispatch_pgfault(utf: &UTrapframe) {
    match PGFAULT_HANDLER.get() {
        Some(handler) => handler(utf),
        None => panic!("page fault va {:#x} with no handler installed", utf.fault_va),
    }
}

global_asm!(
    ".global _pgfault_upcall",
    "_pgfault_upcall:",
    // The frame may sit at any 8-byte offset on a recursive fault.
    "mov rbp, rsp",
    "and rsp, -16",
    "mov rdi, rbp",
    "call {dispatch}",
    "mov rsp, rbp",
    // Push the trap-time rip onto the trap-time stack.
    "mov rax, [rsp + 136]",
    "mov rbx, [rsp + 152]",
    "sub rbx, 8",
    "mov [rbx], rax",
    "mov [rsp + 152], rbx",
    // Skip fault_va and err, restore the registers.
    "add rsp, 16",
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
    // Skip rip; from here on nothing may touch the flags.
    "add rsp, 8",
    "popfq",
    "pop rsp",
    "ret",
    dispatch = sym dispatch_pgfault,
);
