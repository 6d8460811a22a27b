//! x86_64 architecture support
//!
//! - GDT and per-CPU TSS
//! - IDT built from the gate table
//! - Trap frame layout and the trap entry/exit paths

pub mod context;
pub mod gdt;
pub mod idt;
#[cfg(target_os = "none")]
pub mod trapentry;

pub use context::{TrapFrame, TrapFrameDisplay};
pub use gdt::{kernel_stack_top, KSTKSIZE};
pub use idt::{cause, TrapCause};

/// Bring up descriptor tables on this CPU
#[cfg(target_os = "none")]
pub fn init_percpu(cpu: crate::ke::prcb::CpuId) {
    gdt::init_percpu(cpu);
    idt::init_percpu();
}

/// Check if interrupts are enabled
#[cfg(target_os = "none")]
#[inline]
pub fn interrupts_enabled() -> bool {
    ::x86_64::instructions::interrupts::are_enabled()
}

/// Stop this CPU for good
#[cfg(target_os = "none")]
pub fn halt_forever() -> ! {
    use ::x86_64::instructions::{hlt, interrupts};

    interrupts::disable();
    loop {
        hlt();
    }
}
