//! Exo OS Kernel
//!
//! The execution core of a small multiprocessor exokernel for x86_64. User
//! processes ("environments") run isolated in their own address spaces on
//! top of a trusted kernel that only multiplexes the CPUs and delivers
//! traps.
//!
//! # Architecture Overview
//!
//! - **arch** - descriptor tables, trap entry stubs, privileged return
//! - **ke** - kernel executive: big kernel lock, per-CPU records, trap
//!   dispatch, round-robin scheduler, halt/resume, bug checks
//! - **ps** - environment table (generation-tagged arena)
//! - **hal** - the collaborators the core consumes: memory management,
//!   system call implementations, console monitor, interrupt controller
//!
//! # Locking
//!
//! All shared kernel state lives in [`ke::KernelState`] behind the big
//! kernel lock ([`ke::Kernel::state`]). A CPU takes the lock on entry from
//! user mode or when an interrupt wakes it from the idle loop, and gives it
//! up only when it returns to user mode or halts.
//!
//! Everything except the bare-metal glue (`target_os = "none"`) builds on
//! the host, which is where the unit tests run.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]
#![allow(clippy::missing_safety_doc)]

pub mod arch;
pub mod hal;
pub mod ke;
pub mod ps;
pub mod serial;

#[cfg(test)]
mod testing;

pub use hal::{AddressSpace, Platform};
pub use ke::{Kernel, KernelState, KERNEL};

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    KERNEL.set_panicking();
    serial_println!("");
    serial_println!("*** KERNEL PANIC ***");
    serial_println!("{}", info);
    arch::halt_forever()
}
