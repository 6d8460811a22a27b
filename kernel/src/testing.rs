//! In-memory platform for unit tests

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::vec::Vec;

use exo_abi::{Error, Result};

use crate::arch::TrapFrame;
use crate::hal::{AddressSpace, Platform};
use crate::ke::prcb::CpuId;
use crate::ke::KernelState;

/// Records what the kernel asked of its collaborators
pub struct MockPlatform {
    cpu: CpuId,
    fault_va: AtomicU64,
    syscall_result: AtomicI64,
    fail_writes: AtomicBool,
    acks: AtomicUsize,
    monitor_calls: AtomicUsize,
    loaded: Mutex<Vec<Option<AddressSpace>>>,
    destroyed: Mutex<Vec<AddressSpace>>,
    writes: Mutex<Vec<(AddressSpace, u64, Vec<u8>)>>,
    syscalls: Mutex<Vec<(u64, [u64; 5])>>,
}

impl MockPlatform {
    pub const fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            fault_va: AtomicU64::new(0),
            syscall_result: AtomicI64::new(0),
            fail_writes: AtomicBool::new(false),
            acks: AtomicUsize::new(0),
            monitor_calls: AtomicUsize::new(0),
            loaded: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            syscalls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_fault_address(&self, va: u64) {
        self.fault_va.store(va, Ordering::SeqCst);
    }

    pub fn set_syscall_result(&self, ret: i64) {
        self.syscall_result.store(ret, Ordering::SeqCst);
    }

    pub fn fail_user_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn monitor_calls(&self) -> usize {
        self.monitor_calls.load(Ordering::SeqCst)
    }

    /// Address spaces loaded, `None` for the kernel's
    pub fn loaded(&self) -> Vec<Option<AddressSpace>> {
        self.loaded.lock().unwrap().clone()
    }

    pub fn destroyed(&self) -> Vec<AddressSpace> {
        self.destroyed.lock().unwrap().clone()
    }

    pub fn user_writes(&self) -> Vec<(AddressSpace, u64, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn syscalls(&self) -> Vec<(u64, [u64; 5])> {
        self.syscalls.lock().unwrap().clone()
    }
}

impl Platform for MockPlatform {
    fn cpu_id(&self) -> CpuId {
        self.cpu
    }

    fn load_address_space(&self, space: AddressSpace) {
        self.loaded.lock().unwrap().push(Some(space));
    }

    fn load_kernel_address_space(&self) {
        self.loaded.lock().unwrap().push(None);
    }

    fn destroy_address_space(&self, space: AddressSpace) {
        self.destroyed.lock().unwrap().push(space);
    }

    fn fault_address(&self) -> u64 {
        self.fault_va.load(Ordering::SeqCst)
    }

    fn copy_to_user(&self, space: AddressSpace, va: u64, bytes: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Fault);
        }
        self.writes.lock().unwrap().push((space, va, bytes.to_vec()));
        Ok(())
    }

    fn syscall(&self, _state: &mut KernelState, _cpu: CpuId, call: u64, args: [u64; 5]) -> i64 {
        self.syscalls.lock().unwrap().push((call, args));
        self.syscall_result.load(Ordering::SeqCst)
    }

    fn monitor(&self, _tf: Option<&TrapFrame>) {
        self.monitor_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn ack_interrupt(&self) {
        self.acks.fetch_add(1, Ordering::SeqCst);
    }
}

/// A frame as the CPU would build it for a trap from user mode
pub fn user_frame(trapno: u64, rip: u64) -> TrapFrame {
    TrapFrame {
        trapno,
        ..TrapFrame::new_user(rip, exo_abi::memlayout::USTACKTOP as u64)
    }
}
