//! Environment table
//!
//! A fixed arena of [`NENV`] slots. Identifiers carry a generation count in
//! their upper bits, so a lookup with the identifier of an environment that
//! has since been freed (and whose slot may already be reused) fails with
//! [`Error::BadEnv`] instead of silently naming the newcomer.
//!
//! The table is only ever reached through the big kernel lock.

use exo_abi::memlayout::USTACKTOP;
use exo_abi::{EnvId, EnvStatus, Error, Result, NENV};

use crate::arch::TrapFrame;
use crate::hal::AddressSpace;
use crate::ke::prcb::CpuId;

/// An environment (user process)
#[derive(Debug, Clone)]
pub struct Env {
    /// Saved registers while not running
    pub tf: TrapFrame,
    /// Identifier; kept after the slot is freed to seed the next generation
    pub id: EnvId,
    /// Creator, or [`EnvId::SELF`] for environments the kernel made
    pub parent_id: EnvId,
    pub status: EnvStatus,
    /// CPU running it; set while RUNNING and while DYING-but-current
    pub cpu: Option<CpuId>,
    pub space: Option<AddressSpace>,
    /// User-mode page-fault entry point
    pub pgfault_upcall: Option<u64>,
    /// Number of times it has been scheduled
    pub runs: u64,
}

impl Env {
    const fn new() -> Self {
        Self {
            tf: TrapFrame::new(),
            id: EnvId::SELF,
            parent_id: EnvId::SELF,
            status: EnvStatus::Free,
            cpu: None,
            space: None,
            pgfault_upcall: None,
            runs: 0,
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.status == EnvStatus::Free
    }
}

/// How much to trust an identifier handed to a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The slot must be in use and carry exactly this identifier
    Checked,
    /// Return whatever occupies the identifier's slot
    Unchecked,
}

/// The environment arena
pub struct EnvTable {
    envs: [Env; NENV],
}

impl EnvTable {
    pub const fn new() -> Self {
        Self {
            envs: [const { Env::new() }; NENV],
        }
    }

    /// Allocate the lowest free slot
    ///
    /// The new environment is NOT_RUNNABLE with a fresh user frame whose
    /// stack pointer is [`USTACKTOP`]; its creator fills in the rest and
    /// marks it runnable.
    pub fn alloc(&mut self, parent: EnvId, space: AddressSpace) -> Result<EnvId> {
        let (index, env) = self
            .envs
            .iter_mut()
            .enumerate()
            .find(|(_, e)| e.is_free())
            .ok_or(Error::NoFreeEnv)?;

        let id = EnvId::next_generation(env.id, index);
        *env = Env {
            tf: TrapFrame::new_user(0, USTACKTOP as u64),
            id,
            parent_id: parent,
            status: EnvStatus::NotRunnable,
            cpu: None,
            space: Some(space),
            pgfault_upcall: None,
            runs: 0,
        };

        log::debug!("[{}] new env {}", parent, id);
        Ok(id)
    }

    /// Return a slot to the free pool
    ///
    /// Hands back the address space so the caller can have it torn down.
    pub fn free(&mut self, id: EnvId) -> Option<AddressSpace> {
        let env = &mut self.envs[id.index()];
        if env.is_free() || env.id != id {
            return None;
        }
        log::debug!("[{}] free env {}", env.parent_id, id);

        let space = env.space.take();
        env.status = EnvStatus::Free;
        env.cpu = None;
        env.pgfault_upcall = None;
        env.tf = TrapFrame::new();
        space
    }

    /// Look up an environment
    pub fn get(&self, id: EnvId, lookup: Lookup) -> Result<&Env> {
        let env = &self.envs[id.index()];
        match lookup {
            Lookup::Checked if env.is_free() || env.id != id => Err(Error::BadEnv),
            _ => Ok(env),
        }
    }

    /// Look up an environment for modification
    pub fn get_mut(&mut self, id: EnvId, lookup: Lookup) -> Result<&mut Env> {
        let env = &mut self.envs[id.index()];
        match lookup {
            Lookup::Checked if env.is_free() || env.id != id => Err(Error::BadEnv),
            _ => Ok(env),
        }
    }

    /// Resolve `id` on behalf of `caller`
    ///
    /// [`EnvId::SELF`] names the caller. Anything else must be the caller
    /// itself or one of its immediate children.
    pub fn lookup_for(&mut self, caller: EnvId, id: EnvId) -> Result<&mut Env> {
        let id = if id.is_self() { caller } else { id };
        let env = self.get_mut(id, Lookup::Checked)?;
        if env.id != caller && env.parent_id != caller {
            return Err(Error::BadEnv);
        }
        Ok(env)
    }

    /// Change the status of `caller`'s environment `id`
    ///
    /// Only RUNNABLE and NOT_RUNNABLE may be requested this way.
    pub fn set_status(&mut self, caller: EnvId, id: EnvId, status: EnvStatus) -> Result<()> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(Error::Inval);
        }
        let env = self.lookup_for(caller, id)?;
        // A RUNNING caller marking itself keeps running until its next trap.
        if env.status != EnvStatus::Running {
            env.status = status;
        }
        Ok(())
    }

    /// Register `entry` as the page-fault upcall of `caller`'s environment `id`
    pub fn set_pgfault_upcall(&mut self, caller: EnvId, id: EnvId, entry: u64) -> Result<()> {
        self.lookup_for(caller, id)?.pgfault_upcall = Some(entry);
        Ok(())
    }

    #[inline]
    pub fn slot(&self, index: usize) -> &Env {
        &self.envs[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.envs.iter()
    }

    /// Is any slot in use?
    pub fn any_active(&self) -> bool {
        self.envs.iter().any(|e| !e.is_free())
    }
}

impl Default for EnvTable {
    fn default() -> Self {
        Self::new()
    }
}
