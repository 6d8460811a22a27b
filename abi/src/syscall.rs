//! System call numbers
//!
//! Register convention (x86_64): the call number goes in `rax`, arguments
//! in `rdx`, `rcx`, `rbx`, `rdi`, `rsi`, and the result comes back in `rax`.

/// System call number
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Cputs = 0,
    Cgetc = 1,
    GetEnvId = 2,
    EnvDestroy = 3,
    PageAlloc = 4,
    PageMap = 5,
    PageUnmap = 6,
    Exofork = 7,
    EnvSetStatus = 8,
    EnvSetPgfaultUpcall = 9,
    Yield = 10,
}

impl Syscall {
    /// Decode a call number taken from a trap frame
    pub const fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => Self::Cputs,
            1 => Self::Cgetc,
            2 => Self::GetEnvId,
            3 => Self::EnvDestroy,
            4 => Self::PageAlloc,
            5 => Self::PageMap,
            6 => Self::PageUnmap,
            7 => Self::Exofork,
            8 => Self::EnvSetStatus,
            9 => Self::EnvSetPgfaultUpcall,
            10 => Self::Yield,
            _ => return None,
        })
    }
}
