//! POSIX-ish error codes used at every external-interface boundary.
//!
//! Internally every fallible operation returns `Result<T, Errno>`; the
//! numeric codes only get materialized when crossing into a raw-integer FFI
//! boundary (a syscall handler, a C callback signature), matching the way
//! the underlying rump hypercall layer reports errors.

use core::fmt;

/// Subset of errno values this crate ever returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Errno {
    /// No such parameter / device / entry.
    ENOENT,
    /// Supplied buffer too small to hold the result.
    E2BIG,
    /// Allocation failed.
    ENOMEM,
    /// No such device.
    ENXIO,
    /// I/O error (surfaced from a failed or aborted bio).
    EIO,
    /// Device is read-only.
    EROFS,
    /// Bad file descriptor.
    EBADF,
}

impl Errno {
    /// Numeric value, matching the host's errno.h.
    pub const fn code(self) -> i32 {
        match self {
            Errno::ENOENT => 2,
            Errno::EIO => 5,
            Errno::ENXIO => 6,
            Errno::E2BIG => 7,
            Errno::EBADF => 9,
            Errno::ENOMEM => 12,
            Errno::EROFS => 30,
        }
    }

    /// Reconstruct from a numeric value, if it's one we know about.
    pub const fn from_code(code: i32) -> Option<Errno> {
        match code {
            2 => Some(Errno::ENOENT),
            5 => Some(Errno::EIO),
            6 => Some(Errno::ENXIO),
            7 => Some(Errno::E2BIG),
            9 => Some(Errno::EBADF),
            12 => Some(Errno::ENOMEM),
            30 => Some(Errno::EROFS),
            _ => None,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Errno::ENOENT => "ENOENT",
            Errno::E2BIG => "E2BIG",
            Errno::ENOMEM => "ENOMEM",
            Errno::ENXIO => "ENXIO",
            Errno::EIO => "EIO",
            Errno::EROFS => "EROFS",
            Errno::EBADF => "EBADF",
        };
        write!(f, "{name} ({})", self.code())
    }
}

impl core::error::Error for Errno {}

impl From<Errno> for i32 {
    fn from(e: Errno) -> i32 {
        e.code()
    }
}
