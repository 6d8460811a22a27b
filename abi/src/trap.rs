//! Trap numbers and the user-level trap frame

use bytemuck::{Pod, Zeroable};

// Processor-defined exceptions
pub const T_DIVIDE: u64 = 0;
pub const T_DEBUG: u64 = 1;
pub const T_NMI: u64 = 2;
pub const T_BRKPT: u64 = 3;
pub const T_OFLOW: u64 = 4;
pub const T_BOUND: u64 = 5;
pub const T_ILLOP: u64 = 6;
pub const T_DEVICE: u64 = 7;
pub const T_DBLFLT: u64 = 8;
// 9 is reserved
pub const T_TSS: u64 = 10;
pub const T_SEGNP: u64 = 11;
pub const T_STACK: u64 = 12;
pub const T_GPFLT: u64 = 13;
pub const T_PGFLT: u64 = 14;
// 15 is reserved
pub const T_FPERR: u64 = 16;
pub const T_ALIGN: u64 = 17;
pub const T_MCHK: u64 = 18;
pub const T_SIMDERR: u64 = 19;

/// System call vector
pub const T_SYSCALL: u64 = 48;

/// First vector used for hardware IRQs
pub const IRQ_OFFSET: u64 = 32;

// Hardware IRQ numbers, relative to IRQ_OFFSET
pub const IRQ_TIMER: u64 = 0;
pub const IRQ_KBD: u64 = 1;
pub const IRQ_SERIAL: u64 = 4;
pub const IRQ_SPURIOUS: u64 = 7;
pub const IRQ_IDE: u64 = 14;
pub const IRQ_ERROR: u64 = 19;

/// Exception names indexed by trap number
const EXCEPTION_NAMES: [&str; 20] = [
    "Divide error",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "BOUND Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack Fault",
    "General Protection",
    "Page Fault",
    "(unknown trap)",
    "x87 FPU Floating-Point Error",
    "Alignment Check",
    "Machine-Check",
    "SIMD Floating-Point Exception",
];

/// Human-readable name of a trap number
pub fn trap_name(trapno: u64) -> &'static str {
    if let Some(&name) = EXCEPTION_NAMES.get(trapno as usize) {
        return name;
    }
    if trapno == T_SYSCALL {
        return "System call";
    }
    if (IRQ_OFFSET..IRQ_OFFSET + 16).contains(&trapno) {
        return "Hardware Interrupt";
    }
    "(unknown trap)"
}

/// General-purpose registers, in the order the trap entry code pushes them
/// (lowest address first)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PushRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

impl PushRegs {
    /// All registers zero
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
        }
    }
}

/// Frame the kernel pushes on the user exception stack before upcalling
/// the environment's page-fault entry point
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct UTrapframe {
    /// Faulting virtual address
    pub fault_va: u64,
    /// Page-fault error code
    pub err: u64,
    /// Trap-time general registers
    pub regs: PushRegs,
    /// Trap-time instruction pointer
    pub rip: u64,
    /// Trap-time flags
    pub rflags: u64,
    /// Trap-time stack pointer
    pub rsp: u64,
}

impl UTrapframe {
    /// Size in bytes as laid out on the exception stack
    pub const SIZE: usize = core::mem::size_of::<UTrapframe>();
}

// The upcall trampoline addresses these fields by offset.
const _: () = assert!(core::mem::size_of::<PushRegs>() == 15 * 8);
const _: () = assert!(UTrapframe::SIZE == 20 * 8);
