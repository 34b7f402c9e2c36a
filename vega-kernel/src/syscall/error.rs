//! Syscall error codes
//!
//! Defines error codes returned from syscalls. Negative values indicate
//! errors, zero indicates success, positive values may carry additional
//! information depending on the syscall (e.g. a capability handle).
//!
//! `Retry` is not a failure: it reports lock contention on a non-blocking
//! path and the caller's runtime library simply re-issues the syscall.
//! Contention is never escalated to blocking inside the kernel.

use vega_cap::CapError;

/// Syscall return codes.
#[repr(i64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SysError {
    /// Invalid or absent capability.
    InvalidCap = -1,
    /// Invalid argument (malformed user data, wrong thread type,
    /// connection not in a usable state).
    InvalidArg = -2,
    /// Out of memory or kernel object slots.
    NoMemory = -3,
    /// Lock contention on a non-blocking path; re-issue the syscall.
    Retry = -4,
    /// The peer of this connection is exiting; no further progress is
    /// possible on this call.
    ConnectionClosing = -5,
    /// Capability-transfer index out of bounds.
    OutOfRange = -6,
    /// Insufficient rights on a capability.
    NoRights = -7,
    /// Invalid syscall number.
    InvalidSyscall = -8,
}

impl SysError {
    /// Convert to a raw i64 return value.
    #[inline]
    pub const fn as_i64(self) -> i64 {
        self as i64
    }

    /// Get the error name for logging.
    pub const fn name(self) -> &'static str {
        match self {
            Self::InvalidCap => "InvalidCap",
            Self::InvalidArg => "InvalidArg",
            Self::NoMemory => "NoMemory",
            Self::Retry => "Retry",
            Self::ConnectionClosing => "ConnectionClosing",
            Self::OutOfRange => "OutOfRange",
            Self::NoRights => "NoRights",
            Self::InvalidSyscall => "InvalidSyscall",
        }
    }
}

impl From<CapError> for SysError {
    fn from(e: CapError) -> Self {
        match e {
            CapError::InvalidIndex => Self::InvalidCap,
            CapError::EmptySlot => Self::InvalidCap,
            CapError::SlotOccupied => Self::InvalidArg,
            CapError::RightsEscalation => Self::NoRights,
            CapError::TypeMismatch => Self::InvalidCap,
            CapError::OutOfMemory => Self::NoMemory,
            CapError::ObjectNotFound => Self::InvalidCap,
            CapError::InvalidState => Self::InvalidArg,
        }
    }
}

/// Syscall result type.
pub type SysResult<T> = Result<T, SysError>;
