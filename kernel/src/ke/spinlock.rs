//! Kernel Spinlock Implementation
//!
//! Spinlocks provide mutual exclusion for short critical sections.
//! They busy-wait (spin) until the lock becomes available and never
//! sleep or yield to the scheduler.
//!
//! Every lock records which CPU holds it. The kernel runs with interrupts
//! disabled (all traps enter through interrupt gates), so a CPU that tries
//! to take a lock it already holds can never make progress. Debug builds
//! catch this by comparing holder identity and panic with the site of the
//! original acquisition; release builds spin forever.
//!
//! The big kernel lock is a [`SpinLock`] around [`KernelState`]. Its guard
//! is handed along the trap path and consumed either when the CPU returns
//! to user mode or when it halts.
//!
//! [`KernelState`]: super::KernelState
//!
//! # Usage
//! ```ignore
//! let lock = SpinLock::new("envs", 0u32);
//! let mut guard = lock.lock(cpu);
//! *guard += 1;
//! // guard dropped, lock released
//! ```

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[cfg(debug_assertions)]
use core::panic::Location;
#[cfg(debug_assertions)]
use core::sync::atomic::AtomicPtr;

use super::prcb::CpuId;

/// Holder value while the lock is free
const NO_HOLDER: usize = usize::MAX;

/// Depth of the recorded acquisition call stack
#[cfg(debug_assertions)]
const PCS_DEPTH: usize = 10;

/// A raw spinlock without data protection
///
/// Tracks the holding CPU. In debug builds it also remembers where it was
/// acquired and, on bare metal, the return addresses of the acquiring call
/// chain.
pub struct RawSpinLock {
    /// Lock state (true = locked)
    locked: AtomicBool,
    /// CPU holding the lock
    holder: AtomicUsize,
    /// Name for diagnostics
    name: &'static str,
    /// Source location of the current acquisition
    #[cfg(debug_assertions)]
    site: AtomicPtr<Location<'static>>,
    /// Return addresses of the acquiring call chain
    #[cfg(debug_assertions)]
    pcs: [AtomicUsize; PCS_DEPTH],
}

impl RawSpinLock {
    /// Create a new unlocked spinlock
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            holder: AtomicUsize::new(NO_HOLDER),
            name,
            #[cfg(debug_assertions)]
            site: AtomicPtr::new(core::ptr::null_mut()),
            #[cfg(debug_assertions)]
            pcs: [const { AtomicUsize::new(0) }; PCS_DEPTH],
        }
    }

    /// Acquire the lock for `cpu`
    ///
    /// Acquiring a lock `cpu` already holds is a deadlock: debug builds
    /// panic, release builds spin forever.
    #[track_caller]
    pub fn acquire(&self, cpu: CpuId) {
        #[cfg(debug_assertions)]
        if self.holding(cpu) {
            self.dump_holder();
            panic!("CPU {} acquire {}: already holding", cpu, self.name);
        }

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        self.holder.store(cpu, Ordering::Relaxed);
        #[cfg(debug_assertions)]
        self.record_acquisition(Location::caller());
    }

    /// Try to acquire without spinning
    #[track_caller]
    pub fn try_acquire(&self, cpu: CpuId) -> bool {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.holder.store(cpu, Ordering::Relaxed);
        #[cfg(debug_assertions)]
        self.record_acquisition(Location::caller());
        true
    }

    /// Release the lock; `cpu` must be the holder
    pub fn release(&self, cpu: CpuId) {
        #[cfg(debug_assertions)]
        if !self.holding(cpu) {
            self.dump_holder();
            panic!(
                "CPU {} release {}: held by {:?}",
                cpu,
                self.name,
                self.holder()
            );
        }
        #[cfg(not(debug_assertions))]
        let _ = cpu;

        self.clear_holder();
        self.locked.store(false, Ordering::Release);
    }

    /// Does `cpu` hold this lock?
    #[inline]
    pub fn holding(&self, cpu: CpuId) -> bool {
        self.locked.load(Ordering::Relaxed) && self.holder.load(Ordering::Relaxed) == cpu
    }

    /// CPU currently holding the lock
    #[inline]
    pub fn holder(&self) -> Option<CpuId> {
        if !self.locked.load(Ordering::Relaxed) {
            return None;
        }
        match self.holder.load(Ordering::Relaxed) {
            NO_HOLDER => None,
            cpu => Some(cpu),
        }
    }

    /// Check if the lock is currently held
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Lock name
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Release the lock regardless of who holds it
    ///
    /// # Safety
    /// Only for the fatal path, where the holder's guard is stranded in a
    /// trap frame that will never be resumed.
    pub unsafe fn force_release(&self) {
        self.clear_holder();
        self.locked.store(false, Ordering::Release);
    }

    fn clear_holder(&self) {
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        #[cfg(debug_assertions)]
        {
            self.site.store(core::ptr::null_mut(), Ordering::Relaxed);
            self.pcs[0].store(0, Ordering::Relaxed);
        }
    }

    #[cfg(debug_assertions)]
    fn record_acquisition(&self, site: &'static Location<'static>) {
        self.site
            .store(site as *const Location<'static> as *mut _, Ordering::Relaxed);
        let mut pcs = [0usize; PCS_DEPTH];
        caller_pcs(&mut pcs);
        for (slot, pc) in self.pcs.iter().zip(pcs) {
            slot.store(pc, Ordering::Relaxed);
        }
    }

    /// Log who holds the lock and from where
    #[cfg(debug_assertions)]
    fn dump_holder(&self) {
        let site = self.site.load(Ordering::Relaxed);
        // SAFETY: only ever set from `Location::caller()`, which is 'static
        let site = unsafe { site.as_ref() };
        log::error!(
            "lock {} held by CPU {:?}, acquired at {:?}",
            self.name,
            self.holder(),
            site
        );
        for pc in self.pcs.iter().map(|pc| pc.load(Ordering::Relaxed)) {
            if pc == 0 {
                break;
            }
            log::error!("  {:#018x}", pc);
        }
    }
}

/// Walk the frame-pointer chain and record return addresses
#[cfg(all(debug_assertions, target_os = "none"))]
fn caller_pcs(pcs: &mut [usize]) {
    let mut rbp: usize;
    // SAFETY: reading a register
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack, preserves_flags));
    }
    for pc in pcs.iter_mut() {
        // Stop at the end of the chain or once it leaves kernel memory.
        if rbp == 0 || rbp < exo_abi::memlayout::UTOP || rbp % 8 != 0 {
            break;
        }
        // SAFETY: rbp points at a saved-rbp/return-address pair on a kernel stack
        unsafe {
            *pc = *((rbp + 8) as *const usize);
            rbp = *(rbp as *const usize);
        }
    }
}

#[cfg(all(debug_assertions, not(target_os = "none")))]
fn caller_pcs(_pcs: &mut [usize]) {}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new("anonymous")
    }
}

/// A spinlock for mutual exclusion
///
/// Owns the data it protects; the only way to reach the data is through a
/// [`SpinLockGuard`] obtained by locking.
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// SpinLock is Sync if T is Send (data can be sent between CPUs)
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            raw: RawSpinLock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the spinlock for `cpu`, returning a guard that releases on drop
    #[inline]
    #[track_caller]
    pub fn lock(&self, cpu: CpuId) -> SpinLockGuard<'_, T> {
        self.raw.acquire(cpu);
        SpinLockGuard {
            lock: self,
            cpu,
            _not_send: PhantomData,
        }
    }

    /// Try to acquire the lock without spinning
    ///
    /// Returns Some(guard) if successful, None if lock is held
    #[inline]
    #[track_caller]
    pub fn try_lock(&self, cpu: CpuId) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_acquire(cpu) {
            Some(SpinLockGuard {
                lock: self,
                cpu,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    /// Check if the lock is currently held
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Does `cpu` hold this lock?
    #[inline]
    pub fn holding(&self, cpu: CpuId) -> bool {
        self.raw.holding(cpu)
    }

    /// CPU currently holding the lock
    #[inline]
    pub fn holder(&self) -> Option<CpuId> {
        self.raw.holder()
    }

    /// Release the lock without its guard
    ///
    /// # Safety
    /// See [`RawSpinLock::force_release`].
    pub unsafe fn force_unlock(&self) {
        self.raw.force_release();
    }
}

/// RAII guard for spinlock
///
/// Releases the lock when dropped. Must be dropped on the CPU that took it.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    cpu: CpuId,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// CPU holding the lock through this guard
    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Release the lock now
    #[inline]
    pub fn unlock(self) {
        drop(self);
    }
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership of the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership of the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw.release(self.cpu);

        // Give a sibling spinning on this lock a chance to grab it before
        // this CPU comes around to take it again.
        core::hint::spin_loop();
    }
}
