//! In-memory kernel and memory system for unit tests
//!
//! Models environments, their page tables (one map of page number to raw
//! entry per environment) and physical frames. Syscalls enforce the same
//! permission rules as the kernel: an environment may act on itself and on
//! its immediate children, and a mapping may not gain write access its
//! source lacks.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::vec::Vec;

use exo_abi::memlayout::{pgnum, PGSHIFT, PGSIZE, USTACKTOP, UTEXT, UTOP};
use exo_abi::mmu::{pte_addr, FaultCode, PteFlags};
use exo_abi::{EnvId, EnvStatus, Error, Result, UTrapframe};

use crate::fork::resolve_cow_fault;
use crate::pgfault::HandlerSlot;
use crate::syscall::{Forked, UserEnv};

pub const TEXT_PAGE: usize = UTEXT;
pub const DATA_PAGE: usize = UTEXT + PGSIZE;
pub const SLOT_VA: usize = DATA_PAGE + 0x40;
pub const BSS_PAGE: usize = UTEXT + 2 * PGSIZE;
pub const STACK_PAGE: usize = USTACKTOP - PGSIZE;
pub const UPCALL_ENTRY: usize = UTEXT + 0x200;

/// Recorded operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Exofork,
    PageAlloc,
    PageMap,
    PageUnmap,
    SetStatus,
    SetUpcall,
    Destroy,
    Uvpt,
}

struct MockEnvState {
    parent: Option<EnvId>,
    status: EnvStatus,
    upcall: Option<usize>,
    pages: BTreeMap<usize, u64>,
}

#[derive(Default)]
struct World {
    envs: BTreeMap<EnvId, MockEnvState>,
    frames: Vec<Box<[u8; PGSIZE]>>,
    next_slot: usize,
    last_child: Option<EnvId>,
    counts: BTreeMap<&'static str, usize>,
    failures: Vec<(Op, usize, Error)>,
    faults: usize,
}

impl World {
    fn record(&mut self, op: Op) -> Result<()> {
        *self.counts.entry(op_name(op)).or_default() += 1;
        if let Some(pos) = self.failures.iter().position(|(o, _, _)| *o == op) {
            let (_, after, err) = self.failures[pos];
            if after == 0 {
                self.failures.remove(pos);
                return Err(err);
            }
            self.failures[pos].1 -= 1;
        }
        Ok(())
    }

    fn create(&mut self, parent: Option<EnvId>, status: EnvStatus) -> EnvId {
        let id = EnvId::next_generation(EnvId::default(), self.next_slot);
        self.next_slot += 1;
        self.envs.insert(
            id,
            MockEnvState {
                parent,
                status,
                upcall: None,
                pages: BTreeMap::new(),
            },
        );
        id
    }

    /// Resolve `id` on behalf of `caller`
    fn resolve(&self, caller: EnvId, id: EnvId) -> Result<EnvId> {
        if id.is_self() {
            return Ok(caller);
        }
        match self.envs.get(&id) {
            Some(env) if id == caller || env.parent == Some(caller) => Ok(id),
            _ => Err(Error::BadEnv),
        }
    }

    fn new_frame(&mut self) -> u64 {
        self.frames.push(Box::new([0; PGSIZE]));
        (self.frames.len() as u64) << PGSHIFT
    }

    fn pte(&self, id: EnvId, va: usize) -> u64 {
        self.envs
            .get(&id)
            .and_then(|env| env.pages.get(&pgnum(va)))
            .copied()
            .unwrap_or(0)
    }

    fn set_pte(&mut self, id: EnvId, va: usize, pte: u64) {
        let env = self.envs.get_mut(&id).expect("no such environment");
        if pte == 0 {
            env.pages.remove(&pgnum(va));
        } else {
            env.pages.insert(pgnum(va), pte);
        }
    }

    fn frame_mut(&mut self, id: EnvId, va: usize) -> &mut [u8; PGSIZE] {
        let pte = self.pte(id, va);
        assert!(PteFlags::of(pte).contains(PteFlags::P), "{:#x} not mapped in {}", va, id);
        let index = (pte_addr(pte) >> PGSHIFT) as usize - 1;
        &mut self.frames[index]
    }

    fn any_mapped(&self, id: EnvId, first_pn: usize, count: usize) -> u64 {
        let mapped = self.envs[&id]
            .pages
            .range(first_pn..first_pn + count)
            .next()
            .is_some();
        if mapped {
            (PteFlags::P | PteFlags::W | PteFlags::U).bits()
        } else {
            0
        }
    }
}

fn op_name(op: Op) -> &'static str {
    match op {
        Op::Exofork => "exofork",
        Op::PageAlloc => "page_alloc",
        Op::PageMap => "page_map",
        Op::PageUnmap => "page_unmap",
        Op::SetStatus => "set_status",
        Op::SetUpcall => "set_upcall",
        Op::Destroy => "destroy",
        Op::Uvpt => "uvpt",
    }
}

fn check_va(va: usize) -> Result<()> {
    if va >= UTOP || va % PGSIZE != 0 {
        return Err(Error::Inval);
    }
    Ok(())
}

fn check_perm(perm: PteFlags) -> Result<()> {
    if !perm.contains(PteFlags::P | PteFlags::U) || !PteFlags::SYSCALL.contains(perm) {
        return Err(Error::Inval);
    }
    Ok(())
}

/// The kernel and the memory of every environment
pub struct MockKernel {
    world: RefCell<World>,
    root: EnvId,
    as_child: Cell<bool>,
}

impl MockKernel {
    /// A kernel running one environment with a text page, two data pages and
    /// a stack page
    pub fn new() -> Self {
        let mut world = World::default();
        let root = world.create(None, EnvStatus::Running);
        for (va, flags) in [
            (TEXT_PAGE, PteFlags::P | PteFlags::U),
            (DATA_PAGE, PteFlags::P | PteFlags::U | PteFlags::W),
            (BSS_PAGE, PteFlags::P | PteFlags::U | PteFlags::W),
            (STACK_PAGE, PteFlags::P | PteFlags::U | PteFlags::W),
        ] {
            let frame = world.new_frame();
            world.set_pte(root, va, frame | flags.bits());
        }
        Self {
            world: RefCell::new(world),
            root,
            as_child: Cell::new(false),
        }
    }

    pub fn root(&self) -> EnvId {
        self.root
    }

    /// The root environment's view of the system
    pub fn root_env(&self) -> MockEnv<'_> {
        self.env(self.root)
    }

    /// Environment `id`'s view of the system
    pub fn env(&self, id: EnvId) -> MockEnv<'_> {
        MockEnv {
            kernel: self,
            id,
            slot: HandlerSlot::new(),
        }
    }

    /// Create an empty, not-runnable child of `parent`
    pub fn create_child(&self, parent: EnvId) -> EnvId {
        self.world.borrow_mut().create(Some(parent), EnvStatus::NotRunnable)
    }

    /// Make the next `exofork` return on the child side
    pub fn resume_as_child(&self) {
        self.as_child.set(true);
    }

    /// Fail the call to `op` that follows `after` successful ones
    pub fn fail(&self, op: Op, after: usize, err: Error) {
        self.world.borrow_mut().failures.push((op, after, err));
    }

    pub fn count(&self, op: Op) -> usize {
        self.world.borrow().counts.get(op_name(op)).copied().unwrap_or(0)
    }

    /// Write faults delivered to handlers
    pub fn faults(&self) -> usize {
        self.world.borrow().faults
    }

    pub fn last_child(&self) -> Option<EnvId> {
        self.world.borrow().last_child
    }

    pub fn status(&self, id: EnvId) -> Option<EnvStatus> {
        self.world.borrow().envs.get(&id).map(|env| env.status)
    }

    pub fn upcall(&self, id: EnvId) -> Option<usize> {
        self.world.borrow().envs.get(&id).and_then(|env| env.upcall)
    }

    pub fn pte(&self, id: EnvId, va: usize) -> u64 {
        self.world.borrow().pte(id, va)
    }

    pub fn frame_of(&self, id: EnvId, va: usize) -> u64 {
        pte_addr(self.pte(id, va))
    }

    /// Mapped addresses of `id`, ascending
    pub fn mapped(&self, id: EnvId) -> Vec<usize> {
        self.world.borrow().envs[&id]
            .pages
            .keys()
            .map(|pn| pn << PGSHIFT)
            .collect()
    }

    /// Write physical memory behind `va`, ignoring permissions
    pub fn write(&self, id: EnvId, va: usize, bytes: &[u8]) {
        let offset = va % PGSIZE;
        let mut world = self.world.borrow_mut();
        world.frame_mut(id, va)[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read(&self, id: EnvId, va: usize, len: usize) -> Vec<u8> {
        let offset = va % PGSIZE;
        let mut world = self.world.borrow_mut();
        world.frame_mut(id, va)[offset..offset + len].to_vec()
    }

    pub fn read_word(&self, id: EnvId, va: usize) -> u64 {
        if !PteFlags::of(self.pte(id, va)).contains(PteFlags::P) {
            return 0;
        }
        let bytes = self.read(id, va, 8);
        u64::from_ne_bytes(bytes.try_into().expect("eight bytes"))
    }
}

/// One environment's view: implements the syscalls on its behalf
pub struct MockEnv<'k> {
    kernel: &'k MockKernel,
    id: EnvId,
    slot: HandlerSlot,
}

impl MockEnv<'_> {
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// A user-mode store: faults into the COW handler when the page is not
    /// writable, then retries once
    pub fn store(&self, va: usize, bytes: &[u8]) -> Result<()> {
        let pte = self.kernel.pte(self.id, va);
        if !PteFlags::of(pte).contains(PteFlags::P | PteFlags::W) {
            self.kernel.world.borrow_mut().faults += 1;
            let has_handler =
                self.slot.get().is_some() || self.kernel.read_word(self.id, SLOT_VA) != 0;
            if self.kernel.upcall(self.id).is_none() || !has_handler {
                return Err(Error::Fault);
            }

            let mut err = FaultCode::WRITE | FaultCode::USER;
            if PteFlags::of(pte).contains(PteFlags::P) {
                err |= FaultCode::PROTECTION;
            }
            let utf = UTrapframe {
                fault_va: va as u64,
                err: err.bits(),
                rip: UTEXT as u64,
                ..Default::default()
            };
            resolve_cow_fault(self, &utf)?;
            if !PteFlags::of(self.kernel.pte(self.id, va)).contains(PteFlags::W) {
                return Err(Error::Fault);
            }
        }
        self.kernel.write(self.id, va, bytes);
        Ok(())
    }
}

impl UserEnv for MockEnv<'_> {
    fn getenvid(&self) -> EnvId {
        self.id
    }

    fn exofork(&self) -> Result<Forked> {
        let mut world = self.kernel.world.borrow_mut();
        world.record(Op::Exofork)?;
        if self.kernel.as_child.replace(false) {
            return Ok(Forked::Child);
        }
        let child = world.create(Some(self.id), EnvStatus::NotRunnable);
        world.last_child = Some(child);
        Ok(Forked::Parent(child))
    }

    fn page_alloc(&self, env: EnvId, va: usize, perm: PteFlags) -> Result<()> {
        let mut world = self.kernel.world.borrow_mut();
        world.record(Op::PageAlloc)?;
        let id = world.resolve(self.id, env)?;
        check_va(va)?;
        check_perm(perm)?;
        let frame = world.new_frame();
        world.set_pte(id, va, frame | perm.bits());
        Ok(())
    }

    fn page_map(&self, src: EnvId, srcva: usize, dst: EnvId, dstva: usize, perm: PteFlags) -> Result<()> {
        let mut world = self.kernel.world.borrow_mut();
        world.record(Op::PageMap)?;
        let src = world.resolve(self.id, src)?;
        let dst = world.resolve(self.id, dst)?;
        check_va(srcva)?;
        check_va(dstva)?;
        check_perm(perm)?;
        let pte = world.pte(src, srcva);
        let flags = PteFlags::of(pte);
        if !flags.contains(PteFlags::P) || (perm.contains(PteFlags::W) && !flags.contains(PteFlags::W)) {
            return Err(Error::Inval);
        }
        world.set_pte(dst, dstva, pte_addr(pte) | perm.bits());
        Ok(())
    }

    fn page_unmap(&self, env: EnvId, va: usize) -> Result<()> {
        let mut world = self.kernel.world.borrow_mut();
        world.record(Op::PageUnmap)?;
        let id = world.resolve(self.id, env)?;
        check_va(va)?;
        world.set_pte(id, va, 0);
        Ok(())
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<()> {
        let mut world = self.kernel.world.borrow_mut();
        world.record(Op::SetStatus)?;
        let id = world.resolve(self.id, env)?;
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(Error::Inval);
        }
        if let Some(env) = world.envs.get_mut(&id) {
            env.status = status;
        }
        Ok(())
    }

    fn env_set_pgfault_upcall(&self, env: EnvId, entry: usize) -> Result<()> {
        let mut world = self.kernel.world.borrow_mut();
        world.record(Op::SetUpcall)?;
        let id = world.resolve(self.id, env)?;
        if let Some(env) = world.envs.get_mut(&id) {
            env.upcall = Some(entry);
        }
        Ok(())
    }

    fn env_destroy(&self, env: EnvId) -> Result<()> {
        let mut world = self.kernel.world.borrow_mut();
        world.record(Op::Destroy)?;
        let id = world.resolve(self.id, env)?;
        if let Some(env) = world.envs.get_mut(&id) {
            env.status = EnvStatus::Dying;
        }
        Ok(())
    }

    fn uvpml4(&self, index: usize) -> u64 {
        self.kernel.world.borrow().any_mapped(self.id, index << 27, 1 << 27)
    }

    fn uvpdp(&self, index: usize) -> u64 {
        self.kernel.world.borrow().any_mapped(self.id, index << 18, 1 << 18)
    }

    fn uvpd(&self, index: usize) -> u64 {
        self.kernel.world.borrow().any_mapped(self.id, index << 9, 1 << 9)
    }

    fn uvpt(&self, pn: usize) -> u64 {
        let mut world = self.kernel.world.borrow_mut();
        let _ = world.record(Op::Uvpt);
        world.pte(self.id, pn << PGSHIFT)
    }

    fn copy_page(&self, dst: usize, src: usize) {
        let mut world = self.kernel.world.borrow_mut();
        assert!(PteFlags::of(world.pte(self.id, dst)).contains(PteFlags::W));
        let page = *world.frame_mut(self.id, src);
        *world.frame_mut(self.id, dst) = page;
    }

    fn write_word(&self, va: usize, value: u64) {
        let offset = va % PGSIZE;
        let mut world = self.kernel.world.borrow_mut();
        assert!(PteFlags::of(world.pte(self.id, va)).contains(PteFlags::W));
        world.frame_mut(self.id, va)[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }

    fn stack_address(&self) -> usize {
        STACK_PAGE + 0x800
    }

    fn handler_slot(&self) -> &HandlerSlot {
        &self.slot
    }

    fn handler_slot_va(&self) -> usize {
        SLOT_VA
    }

    fn upcall_entry(&self) -> usize {
        UPCALL_ENTRY
    }
}
