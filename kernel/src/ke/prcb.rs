//! Processor Control Block (PRCB)
//!
//! One record per CPU. The status word is the only per-CPU field touched
//! outside the big kernel lock: a CPU publishes HALTED right before it
//! drops the lock and goes idle, and flips itself back to STARTED when the
//! next interrupt arrives. Everything else a CPU owns (its current
//! environment, its last trap frame) lives in the lock-guarded
//! [`KernelState`](super::KernelState).

use core::sync::atomic::{AtomicU32, Ordering};

/// Processor number
pub type CpuId = usize;

/// CPU run state
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuStatus {
    /// Never brought up
    Unused = 0,
    /// Executing kernel or user code
    Started = 1,
    /// Idle in `hlt`, not holding the big kernel lock
    Halted = 2,
}

impl CpuStatus {
    const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Started,
            2 => Self::Halted,
            _ => Self::Unused,
        }
    }
}

/// Processor Control Block
pub struct Prcb {
    /// Processor number (0 for BSP)
    pub number: CpuId,
    status: AtomicU32,
}

impl Prcb {
    pub const fn new(number: CpuId) -> Self {
        Self {
            number,
            status: AtomicU32::new(CpuStatus::Unused as u32),
        }
    }

    #[inline]
    pub fn status(&self) -> CpuStatus {
        CpuStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    /// Mark this CPU started, returning its previous status
    #[inline]
    pub fn mark_started(&self) -> CpuStatus {
        CpuStatus::from_raw(self.status.swap(CpuStatus::Started as u32, Ordering::AcqRel))
    }

    /// Mark this CPU halted, returning its previous status
    #[inline]
    pub fn mark_halted(&self) -> CpuStatus {
        CpuStatus::from_raw(self.status.swap(CpuStatus::Halted as u32, Ordering::AcqRel))
    }
}
