//! Kernel Executive (ke)
//!
//! - **Spinlocks**: holder-tracking spinlock and the big kernel lock
//! - **PRCB**: per-processor run state (STARTED/HALTED)
//! - **Trap**: the single entry point from hardware and user code
//! - **Scheduler**: round-robin selection and environment switching
//! - **Idle**: releasing the lock and halting when nothing is runnable
//! - **Bug check**: fatal kernel errors
//!
//! # Locking
//!
//! All shared kernel state except the per-CPU status words and the panic
//! flag lives in [`KernelState`] behind [`Kernel::state`]. A CPU takes the
//! lock when it enters the kernel from user mode or wakes from halt, and
//! drops it on the way back to user mode or into `hlt`.

pub mod bugcheck;
pub mod idle;
pub mod init;
pub mod prcb;
pub mod scheduler;
pub mod spinlock;
pub mod trap;

pub use prcb::{CpuId, CpuStatus, Prcb};
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
pub use trap::{trap, Exit};

use core::sync::atomic::{AtomicBool, Ordering};

use exo_abi::trap::T_PGFLT;
use exo_abi::{EnvId, EnvStatus, Result, NCPU};

use crate::arch::{TrapFrame, TrapFrameDisplay};
use crate::hal::{AddressSpace, Platform};
use crate::ps::{EnvTable, Lookup};

/// Shared kernel state guarded by the big kernel lock
pub struct KernelState {
    pub envs: EnvTable,
    /// Environment each CPU last ran
    curenv: [Option<EnvId>; NCPU],
    /// Last trap frame each CPU handled, for diagnostics
    last_tf: [Option<TrapFrame>; NCPU],
}

impl KernelState {
    pub const fn new() -> Self {
        Self {
            envs: EnvTable::new(),
            curenv: [None; NCPU],
            last_tf: [None; NCPU],
        }
    }

    #[inline]
    pub fn curenv(&self, cpu: CpuId) -> Option<EnvId> {
        self.curenv[cpu]
    }

    #[inline]
    pub fn set_curenv(&mut self, cpu: CpuId, id: EnvId) {
        self.curenv[cpu] = Some(id);
    }

    #[inline]
    pub fn clear_curenv(&mut self, cpu: CpuId) {
        self.curenv[cpu] = None;
    }

    #[inline]
    pub fn last_tf(&self, cpu: CpuId) -> Option<&TrapFrame> {
        self.last_tf[cpu].as_ref()
    }

    #[inline]
    pub fn record_trap(&mut self, cpu: CpuId, tf: &TrapFrame) {
        self.last_tf[cpu] = Some(*tf);
    }

    /// Diagnostic dump of `tf`
    ///
    /// `cr2` is included only when `tf` is the page fault `cpu` is
    /// handling right now; for any other frame it would be stale.
    pub fn trapframe_display<'a, P: Platform + ?Sized>(
        &self,
        cpu: CpuId,
        tf: &'a TrapFrame,
        platform: &P,
    ) -> TrapFrameDisplay<'a> {
        let cr2 = (tf.trapno == T_PGFLT && self.last_tf(cpu) == Some(tf)).then(|| platform.fault_address());
        tf.display(cr2)
    }

    /// Create a runnable environment starting at `entry`
    pub fn create(&mut self, space: AddressSpace, entry: u64) -> Result<EnvId> {
        let id = self.envs.alloc(EnvId::SELF, space)?;
        let env = self.envs.get_mut(id, Lookup::Checked)?;
        env.tf.rip = entry;
        env.status = EnvStatus::Runnable;
        Ok(id)
    }

    /// Mark an environment for destruction
    ///
    /// The slot is reclaimed by [`reap`](Self::reap) at a later trap
    /// boundary, never while a CPU may still be running it.
    pub fn destroy(&mut self, id: EnvId) -> Result<()> {
        let env = self.envs.get_mut(id, Lookup::Checked)?;
        if env.status != EnvStatus::Dying {
            log::warn!("[{}] destroying env", id);
            env.status = EnvStatus::Dying;
        }
        Ok(())
    }

    /// Give up `cpu`'s hold on its current environment
    ///
    /// A RUNNING environment goes back to RUNNABLE.
    pub(crate) fn deschedule(&mut self, cpu: CpuId) {
        let Some(id) = self.curenv[cpu] else {
            return;
        };
        if let Ok(env) = self.envs.get_mut(id, Lookup::Checked) {
            if env.cpu == Some(cpu) {
                env.cpu = None;
                if env.status == EnvStatus::Running {
                    env.status = EnvStatus::Runnable;
                }
            }
        }
    }

    /// Free every DYING environment that no other CPU is running
    ///
    /// Clears `cpu`'s current environment if it was among them.
    pub fn reap<P: Platform + ?Sized>(&mut self, cpu: CpuId, platform: &P) {
        for index in 0..exo_abi::NENV {
            let env = self.envs.slot(index);
            if env.status != EnvStatus::Dying {
                continue;
            }
            if env.cpu.is_some_and(|owner| owner != cpu) {
                continue;
            }

            let id = env.id;
            if self.curenv[cpu] == Some(id) {
                self.curenv[cpu] = None;
            }
            if let Some(space) = self.envs.free(id) {
                platform.destroy_address_space(space);
            }
            log::debug!("CPU {} reaped {}", cpu, id);
        }
    }
}

impl Default for KernelState {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel: lock-guarded state plus per-CPU records
pub struct Kernel {
    /// Big kernel lock
    pub state: SpinLock<KernelState>,
    cpus: [Prcb; NCPU],
    /// Set once a CPU hits a fatal error; every CPU halts at its next trap
    panicking: AtomicBool,
}

impl Kernel {
    pub const fn new() -> Self {
        let mut cpus = [const { Prcb::new(0) }; NCPU];
        let mut i = 0;
        while i < NCPU {
            cpus[i] = Prcb::new(i);
            i += 1;
        }

        Self {
            state: SpinLock::new("kernel", KernelState::new()),
            cpus,
            panicking: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn prcb(&self, cpu: CpuId) -> &Prcb {
        &self.cpus[cpu]
    }

    #[inline]
    pub fn is_panicking(&self) -> bool {
        self.panicking.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_panicking(&self) {
        self.panicking.store(true, Ordering::Release);
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel instance
pub static KERNEL: Kernel = Kernel::new();
