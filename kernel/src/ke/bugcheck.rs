//! Kernel Bug Check
//!
//! Called when the kernel detects an unrecoverable error, such as a fault
//! taken in kernel mode. The CPU:
//!
//! 1. Raises the global panic flag, so every other CPU halts at its next
//!    trap instead of touching shared state
//! 2. Releases the big kernel lock if it holds it (its guard is stranded in
//!    the interrupted kernel frame and will never run its destructor)
//! 3. Prints the trap frame
//! 4. Panics; the panic handler reports the message and halts
//!
//! A bug check on a CPU that is already handling one just halts.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::TrapFrame;

use super::prcb::CpuId;
use super::Kernel;

/// Nested bug check attempts
static BUGCHECK_COUNT: AtomicU32 = AtomicU32::new(0);

impl Kernel {
    /// Crash the kernel
    ///
    /// `tf` is the frame of the offending trap, if any; `cr2` is printed
    /// with it for page faults.
    #[cold]
    pub fn bug_check(
        &self,
        cpu: CpuId,
        tf: Option<&TrapFrame>,
        cr2: Option<u64>,
        msg: fmt::Arguments<'_>,
    ) -> ! {
        let nested = BUGCHECK_COUNT.fetch_add(1, Ordering::SeqCst);
        self.set_panicking();

        if self.state.holding(cpu) {
            // SAFETY: this CPU owns the lock and will never resume the
            // code that took it
            unsafe { self.state.force_unlock() };
        }

        if nested == 0 || cfg!(test) {
            display_stop_screen(cpu, tf, cr2, &msg);
        }
        panic!("CPU {}: {}", cpu, msg);
    }
}

fn display_stop_screen(cpu: CpuId, tf: Option<&TrapFrame>, cr2: Option<u64>, msg: &fmt::Arguments<'_>) {
    crate::serial_println!("");
    crate::serial_println!("===============================================================================");
    crate::serial_println!("                        *** KERNEL STOP on CPU {} ***", cpu);
    crate::serial_println!("===============================================================================");
    crate::serial_println!("{}", msg);
    log::error!("CPU {}: {}", cpu, msg);
    if let Some(tf) = tf {
        log::error!("{}", tf.display(cr2));
    }
}
