//! Global Descriptor Table (GDT) and Task State Segment (TSS)
//!
//! Long mode ignores most of segmentation, but the kernel still needs:
//!
//! - Null descriptor (required)
//! - Kernel code and data segments (ring 0)
//! - User data and code segments (ring 3)
//! - A TSS descriptor, whose `rsp0` is the stack the CPU switches to when a
//!   trap arrives from user mode
//!
//! Every CPU gets its own TSS and GDT (the TSS descriptor is marked busy
//! once loaded, so it cannot be shared). The selector values are fixed by
//! the append order below and are what user frames are built with.

use spin::Once;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use exo_abi::memlayout::PGSIZE;
use exo_abi::NCPU;

use crate::ke::prcb::CpuId;

/// Kernel text selector
pub const GD_KT: u16 = 0x08;
/// Kernel data selector
pub const GD_KD: u16 = 0x10;
/// User data selector (RPL not included)
pub const GD_UD: u16 = 0x18;
/// User text selector (RPL not included)
pub const GD_UT: u16 = 0x20;
/// Task state segment selector
pub const GD_TSS: u16 = 0x28;

/// Size of a per-CPU kernel stack
pub const KSTKSIZE: usize = 8 * PGSIZE;

/// Size of a per-CPU double-fault stack
const DF_STKSIZE: usize = PGSIZE;

/// Interrupt Stack Table index for double fault handler
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

#[repr(C, align(4096))]
struct Stack<const N: usize>([u8; N]);

impl<const N: usize> Stack<N> {
    const fn new() -> Self {
        Self([0; N])
    }
}

static mut KSTACKS: [Stack<KSTKSIZE>; NCPU] = [const { Stack::new() }; NCPU];
static mut DFSTACKS: [Stack<DF_STKSIZE>; NCPU] = [const { Stack::new() }; NCPU];

static TSS: [Once<TaskStateSegment>; NCPU] = [const { Once::new() }; NCPU];

/// GDT and segment selectors
struct Gdt {
    gdt: GlobalDescriptorTable,
    kernel_code_selector: SegmentSelector,
    kernel_data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

static GDT: [Once<Gdt>; NCPU] = [const { Once::new() }; NCPU];

/// Top of `cpu`'s kernel stack
///
/// This is `rsp0` in the CPU's TSS; a halting CPU resets its stack here.
pub fn kernel_stack_top(cpu: CpuId) -> u64 {
    // SAFETY: only the address is taken, the stack itself is not touched
    let base = unsafe { core::ptr::addr_of!(KSTACKS[cpu]) } as u64;
    base + KSTKSIZE as u64
}

fn double_fault_stack_top(cpu: CpuId) -> u64 {
    // SAFETY: only the address is taken
    let base = unsafe { core::ptr::addr_of!(DFSTACKS[cpu]) } as u64;
    base + DF_STKSIZE as u64
}

/// Build a TSS whose ring-0 stack is `kstack_top`
///
/// The I/O permission bitmap is disabled by pointing its base at the end
/// of the segment.
pub fn build_tss(kstack_top: u64, df_stack_top: u64) -> TaskStateSegment {
    let mut tss = TaskStateSegment::new();
    tss.privilege_stack_table[0] = VirtAddr::new(kstack_top);
    tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = VirtAddr::new(df_stack_top);
    tss.iomap_base = core::mem::size_of::<TaskStateSegment>() as u16;
    tss
}

/// This CPU's TSS, built on first use
pub fn tss(cpu: CpuId) -> &'static TaskStateSegment {
    TSS[cpu].call_once(|| build_tss(kernel_stack_top(cpu), double_fault_stack_top(cpu)))
}

#[cfg_attr(not(target_os = "none"), allow(dead_code))]
fn gdt(cpu: CpuId) -> &'static Gdt {
    GDT[cpu].call_once(|| {
        let mut gdt = GlobalDescriptorTable::new();

        let kernel_code_selector = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data_selector = gdt.append(Descriptor::kernel_data_segment());
        gdt.append(Descriptor::user_data_segment());
        gdt.append(Descriptor::user_code_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(tss(cpu)));

        debug_assert_eq!(kernel_code_selector.0, GD_KT);
        debug_assert_eq!(kernel_data_selector.0, GD_KD);
        debug_assert_eq!(tss_selector.0, GD_TSS);

        Gdt {
            gdt,
            kernel_code_selector,
            kernel_data_selector,
            tss_selector,
        }
    })
}

/// Load this CPU's GDT, segment registers and task register
///
/// Runs once per CPU during bring-up.
#[cfg(target_os = "none")]
pub fn init_percpu(cpu: CpuId) {
    use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
    use x86_64::instructions::tables::load_tss;

    let gdt = gdt(cpu);
    gdt.gdt.load();

    // SAFETY: the selectors index descriptors of the table just loaded
    unsafe {
        CS::set_reg(gdt.kernel_code_selector);
        DS::set_reg(gdt.kernel_data_selector);
        ES::set_reg(gdt.kernel_data_selector);
        SS::set_reg(gdt.kernel_data_selector);
        load_tss(gdt.tss_selector);
    }
}
