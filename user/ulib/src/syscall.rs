//! Kernel interface seen from user mode
//!
//! Everything user-level fork and upcall registration need from the kernel
//! and the memory system goes through [`UserEnv`]. On bare metal the
//! implementation is [`SysEnv`]: syscalls through `int 0x30` and raw
//! pointers into the recursive page-table views.
//!
//! Register convention: call number in `rax`, arguments in `rdx`, `rcx`,
//! `rbx`, `rdi`, `rsi`, result in `rax`.

use core::sync::atomic::{AtomicI32, Ordering};

use exo_abi::mmu::PteFlags;
use exo_abi::{EnvId, EnvStatus, Result};

use crate::pgfault::HandlerSlot;

/// Which side of a fork the caller is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    Child,
    Parent(EnvId),
}

/// Kernel and memory services available to an environment
///
/// Environment arguments accept [`EnvId::SELF`] for the caller.
pub trait UserEnv {
    fn getenvid(&self) -> EnvId;

    /// Create a blank, not-runnable child sharing the caller's registers
    fn exofork(&self) -> Result<Forked>;

    fn page_alloc(&self, env: EnvId, va: usize, perm: PteFlags) -> Result<()>;

    fn page_map(&self, src: EnvId, srcva: usize, dst: EnvId, dstva: usize, perm: PteFlags) -> Result<()>;

    fn page_unmap(&self, env: EnvId, va: usize) -> Result<()>;

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<()>;

    fn env_set_pgfault_upcall(&self, env: EnvId, entry: usize) -> Result<()>;

    fn env_destroy(&self, env: EnvId) -> Result<()>;

    /// Top-level entry `index`
    fn uvpml4(&self, index: usize) -> u64;

    /// Page-directory-pointer entry, indexed by `pn >> 18`
    fn uvpdp(&self, index: usize) -> u64;

    /// Page-directory entry, indexed by `pn >> 9`
    fn uvpd(&self, index: usize) -> u64;

    /// Last-level entry for page number `pn`
    fn uvpt(&self, pn: usize) -> u64;

    /// Copy one page within the caller's memory
    fn copy_page(&self, dst: usize, src: usize);

    /// Store a word in the caller's memory
    fn write_word(&self, va: usize, value: u64);

    /// An address on the stack the caller is executing on
    fn stack_address(&self) -> usize;

    /// The slot the upcall trampoline reads the handler from
    fn handler_slot(&self) -> &HandlerSlot;

    /// Virtual address of [`UserEnv::handler_slot`]
    fn handler_slot_va(&self) -> usize;

    /// Address of the upcall trampoline
    fn upcall_entry(&self) -> usize;
}

/// Cached identifier of the running environment
static THISENV: AtomicI32 = AtomicI32::new(0);

/// The running environment, as last recorded by [`set_thisenv`]
pub fn thisenv() -> EnvId {
    EnvId::from_raw(THISENV.load(Ordering::Relaxed))
}

pub fn set_thisenv(id: EnvId) {
    THISENV.store(id.raw(), Ordering::Relaxed);
}

#[cfg(target_os = "none")]
pub use self::sys::SysEnv;

#[cfg(target_os = "none")]
mod sys {
    use core::arch::asm;

    use exo_abi::memlayout::{PGSIZE, UVPD, UVPDP, UVPML4, UVPT};
    use exo_abi::mmu::PteFlags;
    use exo_abi::syscall::Syscall;
    use exo_abi::{EnvId, EnvStatus, Error, Result};

    use super::{Forked, UserEnv};
    use crate::pgfault::{HandlerSlot, PGFAULT_HANDLER};

    extern "C" {
        fn _pgfault_upcall();
    }

    /// Trap into the kernel
    #[inline(always)]
    fn syscall(call: Syscall, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64) -> i64 {
        let ret: i64;
        // SAFETY: `int 0x30` is the user-accessible syscall gate; the
        // kernel preserves every register except rax. rbx is reserved by
        // LLVM, so the third argument is swapped in and out around the trap.
        unsafe {
            asm!(
                "xchg rbx, {a3}",
                "int 0x30",
                "xchg rbx, {a3}",
                a3 = inout(reg) a3 => _,
                inlateout("rax") call as u64 => ret,
                in("rdx") a1,
                in("rcx") a2,
                in("rdi") a4,
                in("rsi") a5,
            );
        }
        ret
    }

    fn check(ret: i64) -> Result<()> {
        Error::check(ret).map(drop)
    }

    fn env(id: EnvId) -> u64 {
        id.raw() as u64
    }

    /// Read an entry of a recursive page-table view
    fn view(base: u64, index: usize) -> u64 {
        // SAFETY: the recursive slot maps every level read-only for user
        // code; a view entry above a present parent is always mapped
        unsafe { core::ptr::read_volatile((base as *const u64).add(index)) }
    }

    /// Print a string on the console
    pub fn cputs(s: &str) {
        syscall(Syscall::Cputs, s.as_ptr() as u64, s.len() as u64, 0, 0, 0);
    }

    /// The running environment, straight from the kernel
    pub struct SysEnv;

    impl UserEnv for SysEnv {
        fn getenvid(&self) -> EnvId {
            EnvId::from_raw(syscall(Syscall::GetEnvId, 0, 0, 0, 0, 0) as i32)
        }

        fn exofork(&self) -> Result<Forked> {
            match Error::check(syscall(Syscall::Exofork, 0, 0, 0, 0, 0))? {
                0 => Ok(Forked::Child),
                id => Ok(Forked::Parent(EnvId::from_raw(id as i32))),
            }
        }

        fn page_alloc(&self, id: EnvId, va: usize, perm: PteFlags) -> Result<()> {
            check(syscall(Syscall::PageAlloc, env(id), va as u64, perm.bits(), 0, 0))
        }

        fn page_map(&self, src: EnvId, srcva: usize, dst: EnvId, dstva: usize, perm: PteFlags) -> Result<()> {
            check(syscall(
                Syscall::PageMap,
                env(src),
                srcva as u64,
                env(dst),
                dstva as u64,
                perm.bits(),
            ))
        }

        fn page_unmap(&self, id: EnvId, va: usize) -> Result<()> {
            check(syscall(Syscall::PageUnmap, env(id), va as u64, 0, 0, 0))
        }

        fn env_set_status(&self, id: EnvId, status: EnvStatus) -> Result<()> {
            check(syscall(Syscall::EnvSetStatus, env(id), status as u64, 0, 0, 0))
        }

        fn env_set_pgfault_upcall(&self, id: EnvId, entry: usize) -> Result<()> {
            check(syscall(Syscall::EnvSetPgfaultUpcall, env(id), entry as u64, 0, 0, 0))
        }

        fn env_destroy(&self, id: EnvId) -> Result<()> {
            check(syscall(Syscall::EnvDestroy, env(id), 0, 0, 0, 0))
        }

        fn uvpml4(&self, index: usize) -> u64 {
            view(UVPML4, index)
        }

        fn uvpdp(&self, index: usize) -> u64 {
            view(UVPDP, index)
        }

        fn uvpd(&self, index: usize) -> u64 {
            view(UVPD, index)
        }

        fn uvpt(&self, pn: usize) -> u64 {
            view(UVPT, pn)
        }

        fn copy_page(&self, dst: usize, src: usize) {
            // SAFETY: callers pass two distinct mapped pages
            unsafe { core::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, PGSIZE) }
        }

        fn write_word(&self, va: usize, value: u64) {
            // SAFETY: callers pass an address inside a writable mapping
            unsafe { core::ptr::write_volatile(va as *mut u64, value) }
        }

        fn stack_address(&self) -> usize {
            let rsp: usize;
            // SAFETY: reads rsp only
            unsafe { asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags)) };
            rsp
        }

        fn handler_slot(&self) -> &HandlerSlot {
            &PGFAULT_HANDLER
        }

        fn handler_slot_va(&self) -> usize {
            &PGFAULT_HANDLER as *const HandlerSlot as usize
        }

        fn upcall_entry(&self) -> usize {
            _pgfault_upcall as usize
        }
    }
}

#[cfg(target_os = "none")]
pub use self::sys::cputs;
