//! Exo OS user library
//!
//! Runs inside an environment, without the kernel lock:
//!
//! - **syscall** - the [`UserEnv`] interface to the kernel and its `int 0x30`
//!   implementation
//! - **pgfault** - page-fault handler registration, for this environment and
//!   for a child under construction
//! - **fork** - copy-on-write fork and its fault handler
//! - **pfentry** - the assembly upcall trampoline the kernel jumps to
//! - **console** - `log` backend over the console syscall

#![cfg_attr(not(test), no_std)]

pub mod fork;
pub mod pgfault;
pub mod syscall;

#[cfg(target_os = "none")]
pub mod console;
#[cfg(target_os = "none")]
mod pfentry;

#[cfg(test)]
mod testing;

pub use fork::{cow_pgfault, fork, resolve_cow_fault};
pub use pgfault::{install, install_for_child, HandlerSlot, PgfaultHandler, PGFAULT_HANDLER};
pub use syscall::{thisenv, Forked, UserEnv};
