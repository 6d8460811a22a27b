//! Page-fault handler registration
//!
//! The kernel never calls a Rust handler directly. It upcalls the assembly
//! trampoline, which loads the handler from [`PGFAULT_HANDLER`] and calls
//! it with the user trap frame on the exception stack.
//!
//! A child under construction cannot be written to directly. Its handler
//! slot is set by staging a copy of the page holding the slot at `UTEMP`,
//! patching the copy, and mapping it over the child's page in one call.

use core::sync::atomic::{AtomicUsize, Ordering};

use exo_abi::memlayout::{page_round_down, PGSIZE, UTEMP, UXSTACKTOP};
use exo_abi::mmu::PteFlags;
use exo_abi::{EnvId, Result, UTrapframe};

use crate::syscall::UserEnv;

/// User-level page-fault handler
pub type PgfaultHandler = fn(&UTrapframe);

/// Permissions of private read/write user pages
pub(crate) const PERM_RW: PteFlags = PteFlags::P.union(PteFlags::U).union(PteFlags::W);

/// Word holding the current handler (0: none)
#[repr(transparent)]
pub struct HandlerSlot(AtomicUsize);

impl HandlerSlot {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn get(&self) -> Option<PgfaultHandler> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            // SAFETY: only `set` stores non-zero values, and it stores
            // function pointers of this exact type
            raw => Some(unsafe { core::mem::transmute::<usize, PgfaultHandler>(raw) }),
        }
    }

    pub fn raw(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, handler: PgfaultHandler) {
        self.0.store(handler as usize, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

impl Default for HandlerSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// The handler the trampoline calls
pub static PGFAULT_HANDLER: HandlerSlot = HandlerSlot::new();

/// Install `handler` for the calling environment
///
/// The first installation allocates the exception stack and registers the
/// trampoline with the kernel. Later ones only swap the handler.
pub fn install<E: UserEnv + ?Sized>(env: &E, handler: PgfaultHandler) -> Result<()> {
    let slot = env.handler_slot();
    if slot.get().is_some() {
        slot.set(handler);
        return Ok(());
    }

    env.page_alloc(EnvId::SELF, UXSTACKTOP - PGSIZE, PERM_RW)?;
    slot.set(handler);
    if let Err(err) = env.env_set_pgfault_upcall(EnvId::SELF, env.upcall_entry()) {
        slot.clear();
        log::error!("cannot register page-fault upcall: {}", err);
        return Err(err);
    }
    Ok(())
}

/// Install `handler` into `child`, whose memory is the caller's copy-on-write
/// image
pub fn install_for_child<E: UserEnv + ?Sized>(env: &E, child: EnvId, handler: PgfaultHandler) -> Result<()> {
    let page = page_round_down(env.handler_slot_va());

    stage(env, page, handler)?;
    let installed = env.page_map(EnvId::SELF, UTEMP, child, page, PERM_RW);
    let unmapped = env.page_unmap(EnvId::SELF, UTEMP);
    if let Err(err) = installed {
        log::error!("cannot install handler page {:#x} into {}: {}", page, child, err);
        return Err(err);
    }
    unmapped?;

    log::debug!("handler page {:#x} installed into {}", page, child);
    env.env_set_pgfault_upcall(child, env.upcall_entry())
}

/// Copy the page holding the handler slot to `UTEMP` and point the copy's
/// slot at `handler`
fn stage<E: UserEnv + ?Sized>(env: &E, page: usize, handler: PgfaultHandler) -> Result<()> {
    env.page_alloc(EnvId::SELF, UTEMP, PERM_RW)?;
    env.copy_page(UTEMP, page);
    let offset = env.handler_slot_va() - page;
    env.write_word(UTEMP + offset, handler as usize as u64);
    Ok(())
}
