//! Copy-on-write fork
//!
//! The parent walks its own page tables through the recursive views and
//! shares every present user page with the child. Writable pages are shared
//! copy-on-write: tagged [`PteFlags::COW`] and mapped read-only in both
//! spaces. The first write on either side faults into [`cow_pgfault`],
//! which gives the writer a private copy.
//!
//! Two pages are never shared: the exception stack, which the child gets
//! fresh, and the stack page fork itself runs on, which is copied eagerly.

use exo_abi::memlayout::{
    page_round_down, pgnum, NPTENTRIES, PFTEMP, PGSHIFT, PGSIZE, USER_PAGES, UTEMP, UTOP, UXSTACKTOP,
};
use exo_abi::mmu::{FaultCode, PteFlags};
use exo_abi::{EnvId, EnvStatus, Error, Result, UTrapframe};

use crate::pgfault::{self, PERM_RW};
use crate::syscall::{self, Forked, UserEnv};

/// Pages spanned by one entry at each level, top-level first
const L4_PAGES: usize = NPTENTRIES * NPTENTRIES * NPTENTRIES;
const L3_PAGES: usize = NPTENTRIES * NPTENTRIES;
const L2_PAGES: usize = NPTENTRIES;

fn present(entry: u64) -> bool {
    PteFlags::of(entry).contains(PteFlags::P)
}

/// Fork the calling environment
///
/// Returns [`Forked::Child`] in the child and the child's identifier in the
/// parent. On failure the partial child is destroyed.
pub fn fork<E: UserEnv + ?Sized>(env: &E) -> Result<Forked> {
    pgfault::install(env, cow_pgfault)?;

    let child = match env.exofork() {
        Ok(Forked::Child) => {
            syscall::set_thisenv(env.getenvid());
            return Ok(Forked::Child);
        }
        Ok(Forked::Parent(child)) => child,
        Err(err) => {
            log::error!("exofork: {}", err);
            return Err(err);
        }
    };
    log::debug!("new child environment {}", child);

    if let Err(err) = populate(env, child) {
        log::error!("fork of {} failed: {}", child, err);
        if let Err(destroy) = env.env_destroy(child) {
            log::error!("cannot destroy partial child {}: {}", child, destroy);
        }
        return Err(err);
    }
    Ok(Forked::Parent(child))
}

/// Give `child` its address space and handler, then let it run
fn populate<E: UserEnv + ?Sized>(env: &E, child: EnvId) -> Result<()> {
    let stack = page_round_down(env.stack_address());

    for_each_present_page(env, |pn, pte| {
        let va = pn << PGSHIFT;
        if va == UXSTACKTOP - PGSIZE || va == stack {
            return Ok(());
        }
        duppage(env, child, va, pte)
    })?;

    copy_stack(env, child, stack)?;
    env.page_alloc(child, UXSTACKTOP - PGSIZE, PERM_RW).map_err(|err| {
        log::error!("cannot allocate exception stack for {}: {}", child, err);
        err
    })?;
    pgfault::install_for_child(env, child, cow_pgfault)?;
    env.env_set_status(child, EnvStatus::Runnable)
}

/// Visit every present last-level entry below `UTOP`, skipping
/// non-present subtrees
fn for_each_present_page<E, F>(env: &E, mut visit: F) -> Result<()>
where
    E: UserEnv + ?Sized,
    F: FnMut(usize, u64) -> Result<()>,
{
    let mut pn = 0;
    while pn < USER_PAGES {
        if !present(env.uvpml4(pn / L4_PAGES)) {
            pn += L4_PAGES;
        } else if !present(env.uvpdp(pn / L3_PAGES)) {
            pn += L3_PAGES;
        } else if !present(env.uvpd(pn / L2_PAGES)) {
            pn += L2_PAGES;
        } else {
            let pte = env.uvpt(pn);
            if present(pte) {
                visit(pn, pte)?;
            }
            pn += 1;
        }
    }
    Ok(())
}

/// Share the page at `va` with `child`
///
/// Writable and copy-on-write pages become copy-on-write in both spaces.
/// The parent is re-marked even when it was already COW: it may have
/// written since and the child is now a second sharer.
fn duppage<E: UserEnv + ?Sized>(env: &E, child: EnvId, va: usize, pte: u64) -> Result<()> {
    let flags = PteFlags::of(pte) & PteFlags::SYSCALL;

    if !flags.is_shareable_writable() {
        return env.page_map(EnvId::SELF, va, child, va, flags).map_err(|err| {
            log::error!("cannot share page {:#x} with {}: {}", va, child, err);
            err
        });
    }

    let cow = (flags - PteFlags::W) | PteFlags::COW;
    env.page_map(EnvId::SELF, va, child, va, cow).map_err(|err| {
        log::error!("cannot map page {:#x} COW into {}: {}", va, child, err);
        err
    })?;
    env.page_map(EnvId::SELF, va, EnvId::SELF, va, cow).map_err(|err| {
        log::error!("cannot re-mark page {:#x} COW: {}", va, err);
        err
    })
}

/// Give `child` a private copy of the stack page at `stack`
fn copy_stack<E: UserEnv + ?Sized>(env: &E, child: EnvId, stack: usize) -> Result<()> {
    env.page_alloc(child, stack, PERM_RW)?;
    env.page_map(child, stack, EnvId::SELF, UTEMP, PERM_RW)?;
    env.copy_page(UTEMP, stack);
    env.page_unmap(EnvId::SELF, UTEMP).map_err(|err| {
        log::error!("cannot unmap stack copy for {}: {}", child, err);
        err
    })
}

/// Give the faulting environment a private, writable copy of a COW page
///
/// Fails with [`Error::Fault`] if the fault was not a write to a COW page.
pub fn resolve_cow_fault<E: UserEnv + ?Sized>(env: &E, utf: &UTrapframe) -> Result<()> {
    let va = utf.fault_va as usize;
    if va >= UTOP {
        return Err(Error::Fault);
    }
    let write = FaultCode::from_bits_truncate(utf.err).contains(FaultCode::WRITE);
    let pte = env.uvpt(pgnum(va));
    if !write || !PteFlags::of(pte).contains(PteFlags::COW) {
        return Err(Error::Fault);
    }

    let page = page_round_down(va);
    log::info!("COW fault va {:#x} ip {:#x}", va, utf.rip);

    env.page_alloc(EnvId::SELF, PFTEMP, PERM_RW)?;
    env.copy_page(PFTEMP, page);
    env.page_map(EnvId::SELF, PFTEMP, EnvId::SELF, page, PERM_RW)?;
    if let Err(err) = env.page_unmap(EnvId::SELF, PFTEMP) {
        log::error!("cannot unmap PFTEMP: {}", err);
    }
    Ok(())
}

/// Page-fault handler fork installs in both parent and child
pub fn cow_pgfault(utf: &UTrapframe) {
    #[cfg(target_os = "none")]
    if let Err(err) = resolve_cow_fault(&syscall::SysEnv, utf) {
        panic!(
            "[{}] unrecoverable fault va {:#x} ip {:#x} err {:#x}: {}",
            syscall::thisenv(),
            utf.fault_va,
            utf.rip,
            utf.err,
            err
        );
    }

    #[cfg(not(target_os = "none"))]
    log::error!("page-fault upcall for va {:#x} outside an environment", utf.fault_va);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockKernel, Op, BSS_PAGE, SLOT_VA, STACK_PAGE, TEXT_PAGE};

    fn fork_parent(kernel: &MockKernel) -> (crate::testing::MockEnv<'_>, EnvId) {
        let parent = kernel.root_env();
        match fork(&parent).unwrap() {
            Forked::Parent(child) => (parent, child),
            Forked::Child => panic!("expected the parent side"),
        }
    }

    fn flags(kernel: &MockKernel, id: EnvId, va: usize) -> PteFlags {
        PteFlags::of(kernel.pte(id, va))
    }

    #[test]
    fn test_fork_marks_writable_pages_cow_in_both() {
        let kernel = MockKernel::new();
        let (parent, child) = fork_parent(&kernel);

        for id in [parent.id(), child] {
            let f = flags(&kernel, id, BSS_PAGE);
            assert!(f.contains(PteFlags::COW | PteFlags::P | PteFlags::U));
            assert!(!f.contains(PteFlags::W));
        }
        assert_eq!(kernel.frame_of(parent.id(), BSS_PAGE), kernel.frame_of(child, BSS_PAGE));
        assert_eq!(kernel.status(child), Some(EnvStatus::Runnable));
    }

    #[test]
    fn test_fork_shares_read_only_pages_as_is() {
        let kernel = MockKernel::new();
        let (parent, child) = fork_parent(&kernel);

        assert_eq!(flags(&kernel, child, TEXT_PAGE), PteFlags::P | PteFlags::U);
        assert_eq!(flags(&kernel, parent.id(), TEXT_PAGE), PteFlags::P | PteFlags::U);
        assert_eq!(kernel.frame_of(parent.id(), TEXT_PAGE), kernel.frame_of(child, TEXT_PAGE));
    }

    #[test]
    fn test_fork_gives_child_private_stacks() {
        let kernel = MockKernel::new();
        kernel.write(kernel.root(), STACK_PAGE + 8, b"live");
        let (parent, child) = fork_parent(&kernel);

        assert_ne!(kernel.frame_of(parent.id(), STACK_PAGE), kernel.frame_of(child, STACK_PAGE));
        assert_eq!(kernel.read(child, STACK_PAGE + 8, 4), b"live");
        assert!(flags(&kernel, parent.id(), STACK_PAGE).contains(PteFlags::W));
        assert!(!flags(&kernel, child, STACK_PAGE).contains(PteFlags::COW));

        let xstack = UXSTACKTOP - PGSIZE;
        assert_ne!(kernel.frame_of(parent.id(), xstack), kernel.frame_of(child, xstack));
        assert!(!flags(&kernel, child, xstack).contains(PteFlags::COW));
        assert_eq!(kernel.pte(parent.id(), UTEMP), 0);
    }

    #[test]
    fn test_fork_installs_handler_in_child() {
        let kernel = MockKernel::new();
        let (parent, child) = fork_parent(&kernel);

        assert_eq!(parent.handler_slot().raw(), cow_pgfault as usize);
        assert_eq!(kernel.read_word(child, SLOT_VA), cow_pgfault as usize as u64);
        assert!(kernel.upcall(child).is_some());
    }

    #[test]
    fn test_scenario_child_write_isolated_from_parent() {
        let kernel = MockKernel::new();
        kernel.write(kernel.root(), BSS_PAGE + 0x100, b"parent data");
        let (parent, child) = fork_parent(&kernel);
        let child = kernel.env(child);

        child.store(BSS_PAGE + 0x100, b"child!").unwrap();

        assert_eq!(kernel.read(child.id(), BSS_PAGE + 0x100, 11), b"child! data");
        assert_eq!(kernel.read(parent.id(), BSS_PAGE + 0x100, 11), b"parent data");
        assert!(flags(&kernel, child.id(), BSS_PAGE).contains(PteFlags::W));
        assert!(!flags(&kernel, child.id(), BSS_PAGE).contains(PteFlags::COW));
        assert!(flags(&kernel, parent.id(), BSS_PAGE).contains(PteFlags::COW));
        assert_eq!(kernel.pte(child.id(), PFTEMP), 0);
    }

    #[test]
    fn test_parent_write_isolated_from_child() {
        let kernel = MockKernel::new();
        kernel.write(kernel.root(), BSS_PAGE, b"before");
        let (parent, child) = fork_parent(&kernel);

        parent.store(BSS_PAGE, b"after!").unwrap();

        assert_eq!(kernel.read(parent.id(), BSS_PAGE, 6), b"after!");
        assert_eq!(kernel.read(child, BSS_PAGE, 6), b"before");
    }

    #[test]
    fn test_second_write_does_not_fault() {
        let kernel = MockKernel::new();
        let (_parent, child) = fork_parent(&kernel);
        let child = kernel.env(child);

        child.store(BSS_PAGE, b"one").unwrap();
        let faults = kernel.faults();
        let allocs = kernel.count(Op::PageAlloc);
        child.store(BSS_PAGE + 8, b"two").unwrap();

        assert_eq!(faults, 1);
        assert_eq!(kernel.faults(), 1);
        assert_eq!(kernel.count(Op::PageAlloc), allocs);
    }

    #[test]
    fn test_read_fault_is_unrecoverable() {
        let kernel = MockKernel::new();
        let (parent, _child) = fork_parent(&kernel);
        let utf = UTrapframe {
            fault_va: BSS_PAGE as u64,
            err: FaultCode::USER.bits(),
            ..Default::default()
        };
        assert_eq!(resolve_cow_fault(&parent, &utf), Err(Error::Fault));
    }

    #[test]
    fn test_write_to_plain_read_only_page_is_unrecoverable() {
        let kernel = MockKernel::new();
        let parent = kernel.root_env();
        install(&parent);
        assert_eq!(parent.store(TEXT_PAGE, b"x"), Err(Error::Fault));
    }

    fn install(env: &crate::testing::MockEnv<'_>) {
        pgfault::install(env, cow_pgfault).unwrap();
    }

    #[test]
    fn test_fork_failure_destroys_child() {
        let kernel = MockKernel::new();
        let parent = kernel.root_env();
        // Fail the third page_map: mid-way through the scan.
        kernel.fail(Op::PageMap, 2, Error::NoMem);

        assert_eq!(fork(&parent), Err(Error::NoMem));
        let child = kernel.last_child().unwrap();
        assert_eq!(kernel.status(child), Some(EnvStatus::Dying));
    }

    #[test]
    fn test_fork_exofork_failure_reported() {
        let kernel = MockKernel::new();
        let parent = kernel.root_env();
        kernel.fail(Op::Exofork, 0, Error::NoFreeEnv);

        assert_eq!(fork(&parent), Err(Error::NoFreeEnv));
        assert!(kernel.last_child().is_none());
    }

    #[test]
    fn test_fork_in_child_refreshes_thisenv() {
        let kernel = MockKernel::new();
        let env = kernel.root_env();
        kernel.resume_as_child();

        assert_eq!(fork(&env), Ok(Forked::Child));
        assert_eq!(syscall::thisenv(), env.id());
    }

    #[test]
    fn test_scan_skips_absent_subtrees() {
        let kernel = MockKernel::new();
        let env = kernel.root_env();
        let mut seen = Vec::new();

        for_each_present_page(&env, |pn, _| {
            seen.push(pn << PGSHIFT);
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, kernel.mapped(env.id()));
        assert!(kernel.count(Op::Uvpt) < 4 * NPTENTRIES);
    }
}
