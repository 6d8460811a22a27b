//! Exo OS kernel/user ABI
//!
//! Definitions shared by the kernel and by user-level library code:
//!
//! - **memlayout** - virtual address space layout and page helpers
//! - **mmu** - page-table entry bits, including the copy-on-write tag
//! - **env** - environment identifiers and lifecycle states
//! - **trap** - trap numbers and the user-visible trap frame
//! - **syscall** - system call numbers
//! - **error** - error codes carried across the syscall boundary

#![cfg_attr(not(test), no_std)]

pub mod env;
pub mod error;
pub mod memlayout;
pub mod mmu;
pub mod syscall;
pub mod trap;

pub use env::{EnvId, EnvStatus, NENV};
pub use error::{Error, Result};
pub use trap::{PushRegs, UTrapframe};

/// Maximum number of CPUs the kernel manages
pub const NCPU: usize = 8;
