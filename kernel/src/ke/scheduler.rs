//! Round-robin scheduler
//!
//! Each CPU scans the environment table starting just after the
//! environment it last ran and takes the first RUNNABLE one. If there is
//! none but the last environment is still RUNNING on this CPU, that one
//! continues. Otherwise the CPU halts.
//!
//! The scan visits every slot, ending with the last-run slot itself, so
//! a single runnable environment is always found.

use exo_abi::{EnvId, EnvStatus, NENV};

use crate::hal::Platform;
use crate::ps::Lookup;

use super::prcb::CpuId;
use super::spinlock::SpinLockGuard;
use super::trap::Exit;
use super::{Kernel, KernelState};

/// Choose the environment `cpu` should run next
///
/// Never returns an environment that is neither RUNNABLE nor RUNNING on
/// `cpu`.
pub fn select_next(state: &KernelState, cpu: CpuId) -> Option<EnvId> {
    let last = state
        .curenv(cpu)
        .and_then(|id| state.envs.get(id, Lookup::Checked).ok());
    let start = last.map_or(0, |env| env.id.index() + 1);

    for offset in 0..NENV {
        let env = state.envs.slot((start + offset) % NENV);
        if env.status == EnvStatus::Runnable {
            return Some(env.id);
        }
    }

    last.filter(|env| env.status == EnvStatus::Running && env.cpu == Some(cpu))
        .map(|env| env.id)
}

impl Kernel {
    /// Pick the next environment for the lock holder's CPU and leave the
    /// kernel
    pub fn schedule<'k, P: Platform + ?Sized>(
        &'k self,
        mut guard: SpinLockGuard<'k, KernelState>,
        platform: &P,
    ) -> Exit<'k> {
        let cpu = guard.cpu();
        guard.reap(cpu, platform);

        match select_next(&guard, cpu) {
            Some(id) => self.run(guard, id, platform),
            None => self.prepare_halt(guard, platform),
        }
    }

    /// Switch `cpu` to environment `id` and release the lock
    ///
    /// `id` must be RUNNABLE, or RUNNING on the lock holder's CPU.
    pub fn run<'k, P: Platform + ?Sized>(
        &'k self,
        mut guard: SpinLockGuard<'k, KernelState>,
        id: EnvId,
        platform: &P,
    ) -> Exit<'k> {
        let cpu = guard.cpu();

        if guard.curenv(cpu) != Some(id) {
            guard.deschedule(cpu);
        }

        let env = match guard.envs.get_mut(id, Lookup::Checked) {
            Ok(env) => env,
            Err(_) => {
                drop(guard);
                self.bug_check(cpu, None, None, format_args!("run of stale env {}", id));
            }
        };
        debug_assert!(env.cpu.is_none() || env.cpu == Some(cpu));

        env.status = EnvStatus::Running;
        env.cpu = Some(cpu);
        env.runs += 1;
        let tf = env.tf;
        let space = env.space;
        guard.set_curenv(cpu, id);

        log::trace!("CPU {} run {} rip {:#x}", cpu, id, tf.rip);
        match space {
            Some(space) => platform.load_address_space(space),
            None => platform.load_kernel_address_space(),
        }

        guard.unlock();
        Exit::Run(tf)
    }
}
