//! Kernel Executive Initialization
//!
//! The boot CPU calls [`init`] once, after memory management is up and
//! before any CPU schedules. Every CPU, the boot CPU included, then enters
//! [`start_cpu`], which loads its descriptor tables, marks it STARTED and
//! hands it to the scheduler under the big kernel lock.

use exo_abi::{NCPU, NENV};

use crate::hal::{self, Platform};

/// Initialize logging and register the platform services
pub fn init(platform: &'static (dyn Platform + Sync)) {
    crate::serial::init_logger();
    hal::register(platform);
    log::info!("[KE] {} CPUs, {} environment slots", NCPU, NENV);
}

/// Bring up this CPU and enter the scheduler
#[cfg(target_os = "none")]
pub fn start_cpu(cpu: super::CpuId) -> ! {
    use super::KERNEL;

    crate::arch::init_percpu(cpu);
    KERNEL.prcb(cpu).mark_started();
    log::info!("[KE] CPU {} started", cpu);

    let Some(platform) = hal::platform() else {
        crate::arch::halt_forever();
    };
    let guard = KERNEL.state.lock(cpu);
    let exit = KERNEL.schedule(guard, platform);
    super::trap::leave(platform, exit)
}
