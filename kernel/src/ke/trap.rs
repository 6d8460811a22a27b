//! Trap Dispatcher
//!
//! Every interrupt, exception and system call enters the kernel here. The
//! entry stub hands over the frame it built; [`trap`] decides what happens
//! and returns an [`Exit`] describing how the CPU leaves the kernel. Only
//! the bare-metal glue at the bottom of this file turns an [`Exit`] into
//! `iretq` or `hlt`.
//!
//! # Flow
//!
//! 1. A CPU that finds the panic flag set halts.
//! 2. A CPU woken from halt takes the big kernel lock and runs the
//!    scheduler. A fault that arrives there instead of an interrupt is
//!    still fatal.
//! 3. Traps from user mode take the lock, reap DYING environments that
//!    belong to this CPU, and copy the frame into the current environment.
//! 4. The trap is dispatched by cause.
//! 5. The current environment resumes if still RUNNING; otherwise the
//!    scheduler picks the next one.
//!
//! Kernel-mode faults are fatal. User-mode faults destroy only the
//! environment that raised them.

use exo_abi::memlayout::{in_exception_stack, PGSIZE, UXSTACKTOP};
use exo_abi::{EnvId, EnvStatus, Error, UTrapframe};

use crate::arch::{cause, TrapCause, TrapFrame};
use crate::hal::Platform;
use crate::ps::Lookup;

use super::prcb::{CpuId, CpuStatus};
use super::spinlock::SpinLockGuard;
use super::{Kernel, KernelState};

/// How a CPU leaves the kernel
pub enum Exit<'k> {
    /// Enter user mode with this frame; the lock has been released
    Run(TrapFrame),
    /// Return to interrupted kernel code
    Return(TrapFrame),
    /// Halt until the next interrupt on a fresh stack; the lock has been
    /// released and the CPU is marked HALTED
    Idle { stack_top: u64 },
    /// No environments exist; sit in the monitor holding the lock
    Monitor(SpinLockGuard<'k, KernelState>),
    /// Another CPU panicked
    Halt,
}

impl core::fmt::Debug for Exit<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Exit::Run(tf) => write!(f, "Run(rip={:#x})", tf.rip),
            Exit::Return(tf) => write!(f, "Return(rip={:#x})", tf.rip),
            Exit::Idle { stack_top } => write!(f, "Idle({:#x})", stack_top),
            Exit::Monitor(_) => write!(f, "Monitor"),
            Exit::Halt => write!(f, "Halt"),
        }
    }
}

/// Handle a trap described by `tf`
pub fn trap<'k, P: Platform + ?Sized>(kernel: &'k Kernel, platform: &P, tf: &TrapFrame) -> Exit<'k> {
    if kernel.is_panicking() {
        return Exit::Halt;
    }

    let cpu = platform.cpu_id();
    let was_halted = kernel.prcb(cpu).mark_started() == CpuStatus::Halted;
    let cause = cause(tf.trapno);

    if !tf.from_user() {
        if was_halted {
            let mut guard = kernel.state.lock(cpu);
            guard.record_trap(cpu, tf);
            match cause {
                TrapCause::Timer | TrapCause::Device | TrapCause::LapicError => platform.ack_interrupt(),
                TrapCause::Spurious => {}
                TrapCause::Breakpoint => platform.monitor(Some(tf)),
                _ => {
                    drop(guard);
                    return kernel_trap(kernel, platform, cpu, cause, tf);
                }
            }
            return kernel.schedule(guard, platform);
        }
        return kernel_trap(kernel, platform, cpu, cause, tf);
    }

    let mut guard = kernel.state.lock(cpu);
    let Some(cur) = guard.curenv(cpu) else {
        drop(guard);
        kernel.bug_check(cpu, Some(tf), None, format_args!("trap from user mode with no environment"));
    };

    guard.reap(cpu, platform);
    if guard.curenv(cpu).is_none() {
        return kernel.schedule(guard, platform);
    }

    match guard.envs.get_mut(cur, Lookup::Checked) {
        Ok(env) => env.tf = *tf,
        Err(_) => return kernel.schedule(guard, platform),
    }
    guard.record_trap(cpu, tf);

    dispatch(&mut guard, cpu, cur, cause, platform);

    let still_running = guard
        .envs
        .get(cur, Lookup::Checked)
        .is_ok_and(|env| env.status == EnvStatus::Running);
    if still_running {
        kernel.run(guard, cur, platform)
    } else {
        kernel.schedule(guard, platform)
    }
}

/// Trap taken while the kernel itself was running
fn kernel_trap<'k, P: Platform + ?Sized>(
    kernel: &'k Kernel,
    platform: &P,
    cpu: CpuId,
    cause: TrapCause,
    tf: &TrapFrame,
) -> Exit<'k> {
    match cause {
        TrapCause::Breakpoint => {
            platform.monitor(Some(tf));
            Exit::Return(*tf)
        }
        TrapCause::Spurious => Exit::Return(*tf),
        TrapCause::PageFault => {
            let va = platform.fault_address();
            kernel.bug_check(
                cpu,
                Some(tf),
                Some(va),
                format_args!("kernel page fault va {:#x} ip {:#x}", va, tf.rip),
            )
        }
        _ => kernel.bug_check(cpu, Some(tf), None, format_args!("unhandled trap in kernel")),
    }
}

/// Route a user-mode trap of environment `cur`
///
/// Works on the copy of the frame saved in the environment.
fn dispatch<P: Platform + ?Sized>(
    state: &mut KernelState,
    cpu: CpuId,
    cur: EnvId,
    cause: TrapCause,
    platform: &P,
) {
    let Ok(env) = state.envs.get(cur, Lookup::Checked) else {
        return;
    };
    let tf = env.tf;

    match cause {
        TrapCause::PageFault => page_fault(state, cpu, cur, platform),
        TrapCause::Breakpoint => platform.monitor(Some(&tf)),
        TrapCause::Syscall => {
            let r = &tf.regs;
            let ret = platform.syscall(state, cpu, r.rax, [r.rdx, r.rcx, r.rbx, r.rdi, r.rsi]);
            if ret == Error::Inval.code() {
                log::warn!("[{}] invalid system call {}", cur, r.rax);
                let _ = state.destroy(cur);
            } else if let Ok(env) = state.envs.get_mut(cur, Lookup::Checked) {
                env.tf.regs.rax = ret as u64;
            }
        }
        TrapCause::Timer => {
            platform.ack_interrupt();
            if let Ok(env) = state.envs.get_mut(cur, Lookup::Checked) {
                if env.status == EnvStatus::Running {
                    env.status = EnvStatus::Runnable;
                }
            }
        }
        TrapCause::Spurious => {
            log::debug!("spurious interrupt on irq 7");
        }
        TrapCause::Device => platform.ack_interrupt(),
        TrapCause::LapicError => {
            platform.ack_interrupt();
            log::warn!("CPU {}: LAPIC error interrupt", cpu);
        }
        TrapCause::Fault | TrapCause::Unknown => {
            log::error!("[{}] unhandled trap\n{}", cur, state.trapframe_display(cpu, &tf, platform));
            let _ = state.destroy(cur);
        }
    }
}

/// Reflect a user page fault to the environment's upcall
///
/// Pushes a [`UTrapframe`] onto the user exception stack and redirects the
/// environment to its upcall entry. A fault taken while already on the
/// exception stack nests below the trap-time stack pointer, leaving one
/// empty word for the trampoline to return through.
fn page_fault<P: Platform + ?Sized>(state: &mut KernelState, cpu: CpuId, cur: EnvId, platform: &P) {
    let fault_va = platform.fault_address();
    let Ok(env) = state.envs.get_mut(cur, Lookup::Checked) else {
        return;
    };
    let tf = env.tf;

    let (Some(upcall), Some(space)) = (env.pgfault_upcall, env.space) else {
        log::warn!("[{}] user fault va {:#x} ip {:#x}", cur, fault_va, tf.rip);
        log::error!("{}", state.trapframe_display(cpu, &tf, platform));
        let _ = state.destroy(cur);
        return;
    };

    let top = if in_exception_stack(tf.rsp as usize) {
        tf.rsp - 8
    } else {
        UXSTACKTOP as u64
    };
    let utf_va = top.wrapping_sub(UTrapframe::SIZE as u64);
    if utf_va < (UXSTACKTOP - PGSIZE) as u64 {
        log::warn!("[{}] exception stack overflow va {:#x} ip {:#x}", cur, fault_va, tf.rip);
        let _ = state.destroy(cur);
        return;
    }

    let utf = UTrapframe {
        fault_va,
        err: tf.err,
        regs: tf.regs,
        rip: tf.rip,
        rflags: tf.rflags,
        rsp: tf.rsp,
    };
    if let Err(err) = platform.copy_to_user(space, utf_va, bytemuck::bytes_of(&utf)) {
        log::warn!("[{}] cannot push fault frame at {:#x}: {}", cur, utf_va, err);
        let _ = state.destroy(cur);
        return;
    }

    env.tf.rip = upcall;
    env.tf.rsp = utf_va;
}

/// Leave the kernel as `exit` says
#[cfg(target_os = "none")]
pub fn leave<P: Platform + ?Sized>(platform: &P, exit: Exit<'_>) -> ! {
    use crate::arch::trapentry::{idle, pop_tf};

    match exit {
        // SAFETY: frames come from a trap or from a fresh environment
        Exit::Run(tf) | Exit::Return(tf) => unsafe { pop_tf(&tf) },
        // SAFETY: the scheduler hands out this CPU's own stack top
        Exit::Idle { stack_top } => unsafe { idle(stack_top) },
        Exit::Monitor(_guard) => loop {
            platform.monitor(None);
        },
        Exit::Halt => crate::arch::halt_forever(),
    }
}

/// Called by `alltraps` with the frame it built
#[cfg(target_os = "none")]
#[no_mangle]
extern "C" fn trap_entry(tf: *mut TrapFrame) -> ! {
    debug_assert!(!crate::arch::interrupts_enabled());

    let Some(platform) = crate::hal::platform() else {
        crate::arch::halt_forever();
    };
    // SAFETY: alltraps passes the frame it just pushed on this stack
    let tf = unsafe { &*tf };
    let exit = trap(&super::KERNEL, platform, tf);
    leave(platform, exit)
}
