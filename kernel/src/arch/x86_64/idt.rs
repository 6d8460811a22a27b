//! Interrupt Descriptor Table (IDT)
//!
//! The IDT routes every trap the kernel knows about to a small assembly
//! stub in `trapentry.rs`, which builds a [`TrapFrame`] and calls into the
//! dispatcher. All gates are interrupt gates, so interrupts are off for
//! the whole time the kernel runs.
//!
//! [`GATES`] is the single description of the vectors: privilege level
//! (user code may only raise breakpoint, debug and the syscall vector),
//! whether the hardware pushes an error code, and how the dispatcher
//! treats the trap.
//!
//! [`TrapFrame`]: super::context::TrapFrame

use x86_64::PrivilegeLevel;

use exo_abi::trap::*;

/// How the dispatcher treats a vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    /// Page fault; may be reflected to the environment's upcall
    PageFault,
    /// Breakpoint; enters the monitor
    Breakpoint,
    /// System call
    Syscall,
    /// Architectural fault; fatal to the environment that raised it
    Fault,
    /// LAPIC timer; preempts the running environment
    Timer,
    /// Spurious interrupt; ignored
    Spurious,
    /// Device IRQ; acknowledged and otherwise ignored
    Device,
    /// LAPIC error interrupt
    LapicError,
    /// No gate is installed for this vector
    Unknown,
}

/// Gate description
#[derive(Debug, Clone, Copy)]
pub struct GateSpec {
    pub vector: u8,
    /// Lowest privilege allowed to raise the vector with `int`
    pub dpl: PrivilegeLevel,
    /// Hardware pushes an error code
    pub error_code: bool,
    pub cause: TrapCause,
}

const fn gate(vector: u64, dpl: PrivilegeLevel, error_code: bool, cause: TrapCause) -> GateSpec {
    GateSpec {
        vector: vector as u8,
        dpl,
        error_code,
        cause,
    }
}

use PrivilegeLevel::{Ring0 as K, Ring3 as U};
use TrapCause::*;

/// Number of installed gates
pub const GATE_COUNT: usize = 25;

/// Every installed gate, in the order of the stub table in `trapentry.rs`
pub static GATES: [GateSpec; GATE_COUNT] = [
    gate(T_DIVIDE, K, false, Fault),
    gate(T_DEBUG, U, false, Fault),
    gate(T_NMI, K, false, Fault),
    gate(T_BRKPT, U, false, Breakpoint),
    gate(T_OFLOW, K, false, Fault),
    gate(T_BOUND, K, false, Fault),
    gate(T_ILLOP, K, false, Fault),
    gate(T_DEVICE, K, false, Fault),
    gate(T_DBLFLT, K, true, Fault),
    gate(T_TSS, K, true, Fault),
    gate(T_SEGNP, K, true, Fault),
    gate(T_STACK, K, true, Fault),
    gate(T_GPFLT, K, true, Fault),
    gate(T_PGFLT, K, true, PageFault),
    gate(T_FPERR, K, false, Fault),
    gate(T_ALIGN, K, true, Fault),
    gate(T_MCHK, K, false, Fault),
    gate(T_SIMDERR, K, false, Fault),
    gate(T_SYSCALL, U, false, Syscall),
    gate(IRQ_OFFSET + IRQ_TIMER, K, false, Timer),
    gate(IRQ_OFFSET + IRQ_KBD, K, false, Device),
    gate(IRQ_OFFSET + IRQ_SERIAL, K, false, Device),
    gate(IRQ_OFFSET + IRQ_SPURIOUS, K, false, Spurious),
    gate(IRQ_OFFSET + IRQ_IDE, K, false, Device),
    gate(IRQ_OFFSET + IRQ_ERROR, K, false, LapicError),
];

/// Classify a trap number
pub fn cause(trapno: u64) -> TrapCause {
    GATES
        .iter()
        .find(|g| g.vector as u64 == trapno)
        .map_or(Unknown, |g| g.cause)
}

#[cfg(target_os = "none")]
mod hw {
    use spin::Lazy;
    use x86_64::structures::idt::{EntryOptions, InterruptDescriptorTable};
    use x86_64::VirtAddr;

    use super::super::gdt::DOUBLE_FAULT_IST_INDEX;
    use super::super::trapentry::trap_entries;
    use super::GATES;
    use exo_abi::trap::T_DBLFLT;

    /// Point the gate for `vector` at `addr`
    ///
    /// # Safety
    /// `addr` must be a trap stub that builds a trap frame for `vector`.
    unsafe fn set_gate(
        idt: &mut InterruptDescriptorTable,
        vector: u8,
        addr: VirtAddr,
    ) -> &mut EntryOptions {
        unsafe {
            match vector {
                0 => idt.divide_error.set_handler_addr(addr),
                1 => idt.debug.set_handler_addr(addr),
                2 => idt.non_maskable_interrupt.set_handler_addr(addr),
                3 => idt.breakpoint.set_handler_addr(addr),
                4 => idt.overflow.set_handler_addr(addr),
                5 => idt.bound_range_exceeded.set_handler_addr(addr),
                6 => idt.invalid_opcode.set_handler_addr(addr),
                7 => idt.device_not_available.set_handler_addr(addr),
                8 => idt.double_fault.set_handler_addr(addr),
                10 => idt.invalid_tss.set_handler_addr(addr),
                11 => idt.segment_not_present.set_handler_addr(addr),
                12 => idt.stack_segment_fault.set_handler_addr(addr),
                13 => idt.general_protection_fault.set_handler_addr(addr),
                14 => idt.page_fault.set_handler_addr(addr),
                16 => idt.x87_floating_point.set_handler_addr(addr),
                17 => idt.alignment_check.set_handler_addr(addr),
                18 => idt.machine_check.set_handler_addr(addr),
                19 => idt.simd_floating_point.set_handler_addr(addr),
                v => idt[v].set_handler_addr(addr),
            }
        }
    }

    /// IDT with a stub behind every gate in [`GATES`]
    pub(super) static IDT: Lazy<InterruptDescriptorTable> = Lazy::new(|| {
        let mut idt = InterruptDescriptorTable::new();

        for (gate, &entry) in GATES.iter().zip(trap_entries()) {
            debug_assert_eq!(gate.vector as u64, entry[0]);
            // SAFETY: the stub table is generated alongside GATES
            let options = unsafe { set_gate(&mut idt, gate.vector, VirtAddr::new(entry[1])) };
            options.set_privilege_level(gate.dpl);
            if gate.vector as u64 == T_DBLFLT {
                // SAFETY: the IST slot is filled in every CPU's TSS
                unsafe {
                    options.set_stack_index(DOUBLE_FAULT_IST_INDEX);
                }
            }
        }

        idt
    });
}

/// Load the IDT on this CPU
#[cfg(target_os = "none")]
pub fn init_percpu() {
    hw::IDT.load();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_reachable_gates() {
        let user: Vec<u64> = GATES
            .iter()
            .filter(|g| g.dpl == PrivilegeLevel::Ring3)
            .map(|g| g.vector as u64)
            .collect();
        assert_eq!(user, vec![T_DEBUG, T_BRKPT, T_SYSCALL]);
    }

    #[test]
    fn test_error_code_vectors() {
        let with_code: Vec<u64> = GATES
            .iter()
            .filter(|g| g.error_code)
            .map(|g| g.vector as u64)
            .collect();
        assert_eq!(with_code, vec![T_DBLFLT, T_TSS, T_SEGNP, T_STACK, T_GPFLT, T_PGFLT, T_ALIGN]);
    }

    #[test]
    fn test_vectors_are_unique() {
        for (i, a) in GATES.iter().enumerate() {
            for b in &GATES[i + 1..] {
                assert_ne!(a.vector, b.vector);
            }
        }
    }

    #[test]
    fn test_cause() {
        assert_eq!(cause(T_PGFLT), PageFault);
        assert_eq!(cause(T_SYSCALL), Syscall);
        assert_eq!(cause(T_GPFLT), Fault);
        assert_eq!(cause(IRQ_OFFSET + IRQ_TIMER), Timer);
        assert_eq!(cause(IRQ_OFFSET + IRQ_SPURIOUS), Spurious);
        assert_eq!(cause(IRQ_OFFSET + IRQ_KBD), Device);
        assert_eq!(cause(IRQ_OFFSET + IRQ_ERROR), LapicError);
        assert_eq!(cause(200), Unknown);
    }
}
