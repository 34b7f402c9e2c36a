//! Capability error types
//!
//! This module defines the error types that can occur during capability
//! operations such as alloc, copy and free.

use core::fmt;

/// Errors that can occur during capability operations.
///
/// All capability operations return `Result<T, CapError>` to indicate
/// success or failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[must_use = "capability errors must be handled"]
pub enum CapError {
    /// The capability handle is out of bounds for the table.
    InvalidIndex,

    /// The source slot is empty (no capability present).
    EmptySlot,

    /// The destination slot is already occupied.
    ///
    /// Capabilities cannot overwrite existing capabilities; free the
    /// existing one first.
    SlotOccupied,

    /// Attempted to escalate capability rights.
    ///
    /// Rights can only be reduced (attenuated), never increased. This
    /// error occurs when a copy's `rest` rights are not a subset of the
    /// source capability's rights.
    RightsEscalation,

    /// Object type mismatch.
    ///
    /// The capability's object type does not match what was expected
    /// for the operation.
    TypeMismatch,

    /// Out of capability slots.
    ///
    /// No free slot is available in the table.
    OutOfMemory,

    /// Object not found.
    ///
    /// The object referenced by the capability does not exist.
    ObjectNotFound,

    /// Invalid state for the operation.
    InvalidState,
}

impl CapError {
    /// Get a short description of the error.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidIndex => "invalid capability handle",
            Self::EmptySlot => "slot is empty",
            Self::SlotOccupied => "destination slot is occupied",
            Self::RightsEscalation => "cannot increase capability rights",
            Self::TypeMismatch => "object type mismatch",
            Self::OutOfMemory => "out of capability slots",
            Self::ObjectNotFound => "object not found",
            Self::InvalidState => "invalid state for operation",
        }
    }
}

impl fmt::Display for CapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result type for capability operations.
pub type CapResult<T> = Result<T, CapError>;
