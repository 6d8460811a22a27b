//! Error codes
//!
//! Errors cross the syscall boundary as negative integers; inside Rust code
//! they travel as [`Error`] through [`Result`].

use core::fmt;

/// Kernel and library error
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Unspecified or unknown problem
    Unspecified = -1,
    /// Environment doesn't exist or otherwise cannot be used
    BadEnv = -2,
    /// Invalid parameter
    Inval = -3,
    /// Request failed due to memory shortage
    NoMem = -4,
    /// Attempt to create a new environment beyond the maximum allowed
    NoFreeEnv = -5,
    /// Memory fault
    Fault = -6,
}

/// Result type used throughout the kernel and user library
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Negative wire value of this error
    #[inline]
    pub const fn code(self) -> i64 {
        self as i32 as i64
    }

    /// Decode a negative syscall return value
    ///
    /// Non-negative values are not errors and yield `None`; negative values
    /// outside the known range map to [`Error::Unspecified`].
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0.. => None,
            -2 => Some(Self::BadEnv),
            -3 => Some(Self::Inval),
            -4 => Some(Self::NoMem),
            -5 => Some(Self::NoFreeEnv),
            -6 => Some(Self::Fault),
            _ => Some(Self::Unspecified),
        }
    }

    /// Split a raw syscall return value into a result
    #[inline]
    pub const fn check(ret: i64) -> Result<i64> {
        match Self::from_code(ret) {
            Some(err) => Err(err),
            None => Ok(ret),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Error::Unspecified => "unspecified error",
            Error::BadEnv => "bad environment",
            Error::Inval => "invalid parameter",
            Error::NoMem => "out of memory",
            Error::NoFreeEnv => "out of environments",
            Error::Fault => "segmentation fault",
        };
        f.write_str(text)
    }
}
