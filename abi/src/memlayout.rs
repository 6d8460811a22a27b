//! Virtual memory layout
//!
//! ```text
//!     UTOP, UXSTACKTOP -> +------------------------------+ 0x0000_0080_0000_0000
//!                         |  user exception stack (1pg)  |
//!                         +------------------------------+
//!                         |        empty guard page      |
//!            USTACKTOP -> +------------------------------+
//!                         |      normal user stack       |
//!                         |              ...             |
//!                UTEXT -> +------------------------------+ 0x0000_0000_0080_0000
//!               PFTEMP -> |  COW scratch page            |
//!                         |              ...             |
//!                UTEMP -> +------------------------------+ 0x0000_0000_0020_0000
//! ```
//!
//! Page tables are mapped recursively through top-level slot
//! [`RECURSIVE_INDEX`], which gives user code read-only views of every
//! level (`uvpml4`, `uvpdp`, `uvpd`, `uvpt`).

/// Bytes per page
pub const PGSIZE: usize = 4096;

/// log2(PGSIZE)
pub const PGSHIFT: usize = 12;

/// Entries per page-table page (every level)
pub const NPTENTRIES: usize = 512;

/// Bytes mapped by one last-level page table
pub const PTSIZE: usize = PGSIZE * NPTENTRIES;

/// Top of user-accessible memory
pub const UTOP: usize = 0x0000_0080_0000_0000;

/// Top of the user exception stack
pub const UXSTACKTOP: usize = UTOP;

/// Top of the normal user stack (one guard page below the exception stack)
pub const USTACKTOP: usize = UTOP - 2 * PGSIZE;

/// Where user programs are linked
pub const UTEXT: usize = 2 * PTSIZE * 2;

/// Scratch area for temporary mappings
pub const UTEMP: usize = UTEXT / 4;

/// Scratch page used by the copy-on-write fault handler
pub const PFTEMP: usize = UTEMP + PTSIZE - PGSIZE;

/// Top-level page-table slot that maps the page tables themselves
pub const RECURSIVE_INDEX: usize = 510;

/// Total number of pages below UTOP
pub const USER_PAGES: usize = UTOP / PGSIZE;

/// Virtual page number of an address
#[inline]
pub const fn pgnum(va: usize) -> usize {
    va >> PGSHIFT
}

/// Round an address down to its page boundary
#[inline]
pub const fn page_round_down(va: usize) -> usize {
    va & !(PGSIZE - 1)
}

/// Is `va` inside the user exception stack page?
#[inline]
pub const fn in_exception_stack(va: usize) -> bool {
    va >= UXSTACKTOP - PGSIZE && va < UXSTACKTOP
}

/// Sign-extend bit 47 to produce a canonical x86_64 address
#[inline]
pub const fn canonical(addr: u64) -> u64 {
    (((addr << 16) as i64) >> 16) as u64
}

const R: u64 = RECURSIVE_INDEX as u64;

/// Base of the last-level view (one entry per user page)
pub const UVPT: u64 = canonical(R << 39);

/// Base of the page-directory view
pub const UVPD: u64 = canonical((R << 39) | (R << 30));

/// Base of the page-directory-pointer view
pub const UVPDP: u64 = canonical((R << 39) | (R << 30) | (R << 21));

/// Base of the top-level view
pub const UVPML4: u64 = canonical((R << 39) | (R << 30) | (R << 21) | (R << 12));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_ordering() {
        assert!(UTEMP < PFTEMP);
        assert!(PFTEMP < UTEXT);
        assert!(UTEXT < USTACKTOP);
        assert_eq!(UXSTACKTOP - USTACKTOP, 2 * PGSIZE);
        assert_eq!(PFTEMP % PGSIZE, 0);
    }

    #[test]
    fn test_exception_stack_bounds() {
        assert!(in_exception_stack(UXSTACKTOP - 1));
        assert!(in_exception_stack(UXSTACKTOP - PGSIZE));
        assert!(!in_exception_stack(UXSTACKTOP));
        assert!(!in_exception_stack(USTACKTOP));
    }

    #[test]
    fn test_recursive_views_are_canonical() {
        assert_eq!(UVPT, 0xFFFF_FF00_0000_0000);
        assert_eq!(UVPML4 & 0xFFF, 0);
        assert_eq!(canonical(UVPD), UVPD);
    }
}
