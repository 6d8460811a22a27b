//! Environment identifiers and lifecycle states

use core::fmt;

/// log2 of the environment table size
pub const LOG2NENV: u32 = 10;

/// Number of slots in the environment table
pub const NENV: usize = 1 << LOG2NENV;

/// Environment identifier
///
/// The low [`LOG2NENV`] bits select a table slot; the remaining bits are a
/// generation count bumped every time the slot is reused, so an identifier
/// naming a destroyed environment never aliases its successor. Identifier 0
/// is reserved and means "the calling environment" at the syscall boundary.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EnvId(i32);

impl EnvId {
    /// The calling environment
    pub const SELF: EnvId = EnvId(0);

    /// Generation increment
    const GEN_STEP: i32 = 1 << LOG2NENV;

    /// Wrap a raw identifier
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Raw identifier value
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Table slot this identifier refers to
    #[inline]
    pub const fn index(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }

    /// Is this the "caller" shorthand?
    #[inline]
    pub const fn is_self(self) -> bool {
        self.0 == 0
    }

    /// Identifier for the next use of the slot currently named by `prev`
    ///
    /// `prev` is the identifier the slot last carried (0 if never used).
    pub const fn next_generation(prev: EnvId, index: usize) -> EnvId {
        let mut generation = (prev.0 & !(NENV as i32 - 1)).wrapping_add(Self::GEN_STEP);
        if generation <= 0 {
            generation = Self::GEN_STEP;
        }
        EnvId(generation | index as i32)
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Environment lifecycle state
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvStatus {
    /// Slot unused
    #[default]
    Free = 0,
    /// Marked for destruction; reclaimed at the next trap boundary
    Dying = 1,
    /// Waiting to be picked by a scheduler
    Runnable = 2,
    /// Running on exactly one CPU
    Running = 3,
    /// Exists but must not be scheduled (e.g. a child still being built)
    NotRunnable = 4,
}

impl EnvStatus {
    /// Decode a status passed through a syscall register
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Dying),
            2 => Some(Self::Runnable),
            3 => Some(Self::Running),
            4 => Some(Self::NotRunnable),
            _ => None,
        }
    }
}
