//! Hardware Abstraction Layer (hal)
//!
//! The execution core does not own memory management, the console, the
//! LAPIC or the system call implementations. It reaches them through
//! [`Platform`], which the boot code registers once before the first CPU
//! enters the scheduler.
//!
//! Every policy function in `ke` takes the platform as a parameter, so the
//! host test suite drives them with an in-memory implementation.

use spin::Once;

use exo_abi::Result;

use crate::arch::TrapFrame;
use crate::ke::prcb::CpuId;
use crate::ke::KernelState;

/// Root of an address space (physical address of its top-level table)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace(pub u64);

/// Services the execution core consumes
pub trait Platform {
    /// Number of the CPU executing the caller
    fn cpu_id(&self) -> CpuId;

    /// Switch to an environment's address space
    fn load_address_space(&self, space: AddressSpace);

    /// Switch to the kernel-only address space
    fn load_kernel_address_space(&self);

    /// Tear down an address space and release its pages
    fn destroy_address_space(&self, space: AddressSpace);

    /// Faulting linear address of the page fault being handled (`cr2`)
    fn fault_address(&self) -> u64;

    /// Copy `bytes` to `va` in `space`
    ///
    /// Fails with [`Error::Fault`](exo_abi::Error::Fault) unless the whole
    /// range is mapped present, user and writable.
    fn copy_to_user(&self, space: AddressSpace, va: u64, bytes: &[u8]) -> Result<()>;

    /// Run system call `call` for the current environment of `cpu`
    ///
    /// Called with the big kernel lock held. A call that gives up the CPU
    /// (yield, destroying the caller) changes the caller's status; the
    /// dispatcher reschedules whenever the caller is no longer RUNNING.
    fn syscall(&self, state: &mut KernelState, cpu: CpuId, call: u64, args: [u64; 5]) -> i64;

    /// Interactive kernel monitor
    ///
    /// Never returns on its own. Returning means the operator chose to
    /// continue, and the interrupted context (kernel code or the current
    /// environment) resumes.
    fn monitor(&self, tf: Option<&TrapFrame>);

    /// Signal end of interrupt to the local APIC
    fn ack_interrupt(&self);
}

static PLATFORM: Once<&'static (dyn Platform + Sync)> = Once::new();

/// Install the platform services; later calls are ignored
pub fn register(platform: &'static (dyn Platform + Sync)) {
    PLATFORM.call_once(|| platform);
}

/// Registered platform services
pub fn platform() -> Option<&'static (dyn Platform + Sync)> {
    PLATFORM.get().copied()
}
