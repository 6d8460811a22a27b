//! Trap frame for x86_64
//!
//! The trap entry stubs build this frame on the kernel stack: the CPU
//! pushes `ss`, `rsp`, `rflags`, `cs` and `rip` (and an error code for some
//! exceptions), the stub pushes a zero error code where the hardware does
//! not, then the trap number, then the general registers in [`PushRegs`]
//! order. The layout must match `trapentry.rs` field for field.

use core::fmt;

use exo_abi::trap::{trap_name, PushRegs, T_PGFLT};
use exo_abi::mmu::FaultCode;

use super::gdt::{GD_UD, GD_UT};

/// RFLAGS.IF
pub const FL_IF: u64 = 0x200;

/// Saved processor state at a trap
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrapFrame {
    pub regs: PushRegs,
    pub trapno: u64,
    pub err: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

// trapentry.rs pops 15 registers, skips trapno/err, then `iretq`.
const _: () = assert!(core::mem::size_of::<TrapFrame>() == 22 * 8);

impl TrapFrame {
    pub const fn new() -> Self {
        Self {
            regs: PushRegs::zeroed(),
            trapno: 0,
            err: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }

    /// Initial frame of a new environment
    ///
    /// User code and data selectors at privilege 3, interrupts enabled.
    pub const fn new_user(rip: u64, rsp: u64) -> Self {
        Self {
            rip,
            rsp,
            cs: GD_UT as u64 | 3,
            ss: GD_UD as u64 | 3,
            rflags: FL_IF,
            ..Self::new()
        }
    }

    /// Did the trap come from privilege level 3?
    #[inline]
    pub const fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Diagnostic formatter
    ///
    /// `cr2` is printed for page faults when the caller knows it belongs to
    /// this frame.
    pub fn display(&self, cr2: Option<u64>) -> TrapFrameDisplay<'_> {
        TrapFrameDisplay { tf: self, cr2 }
    }
}

/// Multi-line dump of a [`TrapFrame`]
pub struct TrapFrameDisplay<'a> {
    tf: &'a TrapFrame,
    cr2: Option<u64>,
}

impl fmt::Display for TrapFrameDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tf = self.tf;
        let r = &tf.regs;
        writeln!(f, "TRAP frame at {:p}", tf)?;
        for (name, value) in [
            ("r15", r.r15),
            ("r14", r.r14),
            ("r13", r.r13),
            ("r12", r.r12),
            ("r11", r.r11),
            ("r10", r.r10),
            ("r9 ", r.r9),
            ("r8 ", r.r8),
            ("rdi", r.rdi),
            ("rsi", r.rsi),
            ("rbp", r.rbp),
            ("rdx", r.rdx),
            ("rcx", r.rcx),
            ("rbx", r.rbx),
            ("rax", r.rax),
        ] {
            writeln!(f, "  {}  0x{:016x}", name, value)?;
        }
        writeln!(f, "  trap 0x{:08x} {}", tf.trapno, trap_name(tf.trapno))?;
        if tf.trapno == T_PGFLT {
            if let Some(cr2) = self.cr2 {
                writeln!(f, "  cr2  0x{:016x}", cr2)?;
            }
            let code = FaultCode::from_bits_truncate(tf.err);
            writeln!(
                f,
                "  err  0x{:08x} [{}, {}, {}]",
                tf.err,
                if code.contains(FaultCode::USER) { "user" } else { "kernel" },
                if code.contains(FaultCode::WRITE) { "write" } else { "read" },
                if code.contains(FaultCode::PROTECTION) { "protection" } else { "not-present" },
            )?;
        } else {
            writeln!(f, "  err  0x{:08x}", tf.err)?;
        }
        writeln!(f, "  rip  0x{:016x}", tf.rip)?;
        writeln!(f, "  cs   0x----{:04x}", tf.cs)?;
        write!(f, "  flag 0x{:016x}", tf.rflags)?;
        if tf.from_user() {
            write!(f, "\n  rsp  0x{:016x}", tf.rsp)?;
            write!(f, "\n  ss   0x----{:04x}", tf.ss)?;
        }
        Ok(())
    }
}
