//! Page-table entry and page-fault error code bits

bitflags::bitflags! {
    /// Page-table entry flags (low 12 bits of an entry)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PteFlags: u64 {
        /// Present
        const P = 0x001;
        /// Writable
        const W = 0x002;
        /// User accessible
        const U = 0x004;
        /// Write-through
        const PWT = 0x008;
        /// Cache disable
        const PCD = 0x010;
        /// Accessed
        const A = 0x020;
        /// Dirty
        const D = 0x040;
        /// Page size (large page at directory levels)
        const PS = 0x080;
        /// Global
        const G = 0x100;
        /// Bits 9-11 are ignored by the MMU and free for software
        const AVAIL = 0xE00;
        /// Copy-on-write; one of the software-available bits
        const COW = 0x800;
    }
}

impl PteFlags {
    /// Bits user code may pass to the page mapping syscalls
    pub const SYSCALL: PteFlags = PteFlags::P
        .union(PteFlags::W)
        .union(PteFlags::U)
        .union(PteFlags::AVAIL);

    /// Flags of a raw page-table entry
    #[inline]
    pub const fn of(pte: u64) -> PteFlags {
        PteFlags::from_bits_truncate(pte & 0xFFF)
    }

    /// Is this a writable mapping or a copy-on-write one?
    #[inline]
    pub const fn is_shareable_writable(self) -> bool {
        self.contains(PteFlags::W) || self.contains(PteFlags::COW)
    }
}

/// Physical address of a raw page-table entry
#[inline]
pub const fn pte_addr(pte: u64) -> u64 {
    pte & 0x000F_FFFF_FFFF_F000
}

bitflags::bitflags! {
    /// Page-fault error code pushed by the processor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FaultCode: u64 {
        /// Protection violation (clear: page not present)
        const PROTECTION = 0x1;
        /// Caused by a write (clear: read)
        const WRITE = 0x2;
        /// Happened in user mode (clear: kernel)
        const USER = 0x4;
        /// Reserved bit set in a paging structure
        const RESERVED = 0x8;
        /// Instruction fetch
        const INSTRUCTION = 0x10;
    }
}
