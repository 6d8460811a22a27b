//! Halting an idle CPU
//!
//! When the scheduler finds nothing to run, the CPU gives up its current
//! environment, switches to the kernel address space, publishes HALTED and
//! drops the big kernel lock. It then resets its stack to the TSS `rsp0`
//! top and waits in `hlt` with interrupts enabled. The next interrupt comes
//! back through the trap dispatcher, which sees HALTED, flips the CPU to
//! STARTED and takes the lock before touching anything shared.
//!
//! If no environment exists at all, there is nothing an interrupt could
//! ever wake up for, and the CPU drops into the monitor instead.

use crate::arch::kernel_stack_top;
use crate::hal::Platform;

use super::spinlock::SpinLockGuard;
use super::trap::Exit;
use super::{Kernel, KernelState};

impl Kernel {
    /// Prepare the lock holder's CPU to halt
    pub fn prepare_halt<'k, P: Platform + ?Sized>(
        &'k self,
        mut guard: SpinLockGuard<'k, KernelState>,
        platform: &P,
    ) -> Exit<'k> {
        let cpu = guard.cpu();

        if !guard.envs.any_active() {
            log::info!("No runnable environments in the system!");
            return Exit::Monitor(guard);
        }

        guard.deschedule(cpu);
        guard.clear_curenv(cpu);
        platform.load_kernel_address_space();

        // Publish HALTED before the lock is free: whoever takes the lock
        // next sees this CPU idle.
        self.prcb(cpu).mark_halted();
        guard.unlock();

        log::trace!("CPU {} halting", cpu);
        Exit::Idle {
            stack_top: kernel_stack_top(cpu),
        }
    }
}
