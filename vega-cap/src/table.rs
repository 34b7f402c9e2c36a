//! Per-process capability table
//!
//! Every process owns a flat table of capability slots. A capability
//! handle ([`Cap`]) is the slot's index; it is the only name a process
//! has for a kernel object. Handles are process-local: the same object
//! held by two processes has unrelated handles in their two tables.

use core::fmt;

use crate::error::{CapError, CapResult};
use crate::slot::{CapSlot, ObjectRef, ObjectType};

/// Number of capability slots per process.
pub const MAX_CAPS: usize = 256;

/// A process-local capability handle.
///
/// Wraps the slot index in the owning process's [`CapTable`]. Handle 0 is
/// valid (it is simply slot 0); there is no null handle at this layer —
/// syscall arguments use sentinels defined by the ABI crate instead.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Cap(u32);

impl Cap {
    /// Create a handle from a raw slot index.
    #[inline]
    #[must_use]
    pub const fn from_raw(index: u32) -> Self {
        Self(index)
    }

    /// Get the raw slot index.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Cap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cap({})", self.0)
    }
}

impl fmt::Display for Cap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A process's capability table.
///
/// Allocation scans for the lowest free slot, so freshly created processes
/// hand out small, predictable handles.
pub struct CapTable {
    slots: [CapSlot; MAX_CAPS],
}

impl CapTable {
    /// Create an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [CapSlot::EMPTY; MAX_CAPS],
        }
    }

    /// Install a capability in the lowest free slot.
    ///
    /// Returns the new handle, or `OutOfMemory` if the table is full.
    pub fn alloc(&mut self, slot: CapSlot) -> CapResult<Cap> {
        if slot.is_empty() {
            return Err(CapError::EmptySlot);
        }
        for (i, entry) in self.slots.iter_mut().enumerate() {
            if entry.is_empty() {
                *entry = slot;
                return Ok(Cap::from_raw(i as u32));
            }
        }
        Err(CapError::OutOfMemory)
    }

    /// Look up a handle.
    pub fn get(&self, cap: Cap) -> CapResult<&CapSlot> {
        let slot = self
            .slots
            .get(cap.raw() as usize)
            .ok_or(CapError::InvalidIndex)?;
        if slot.is_empty() {
            return Err(CapError::EmptySlot);
        }
        Ok(slot)
    }

    /// Look up a handle, checking the object type.
    ///
    /// Returns the referenced object on success.
    pub fn get_typed(&self, cap: Cap, expected: ObjectType) -> CapResult<ObjectRef> {
        let slot = self.get(cap)?;
        if slot.obj_type() != expected {
            return Err(CapError::TypeMismatch);
        }
        Ok(slot.object())
    }

    /// Remove the capability in `cap` and return it.
    ///
    /// The caller is responsible for dropping the kernel-side reference
    /// the removed slot held.
    pub fn remove(&mut self, cap: Cap) -> CapResult<CapSlot> {
        let slot = self
            .slots
            .get_mut(cap.raw() as usize)
            .ok_or(CapError::InvalidIndex)?;
        if slot.is_empty() {
            return Err(CapError::EmptySlot);
        }
        Ok(core::mem::replace(slot, CapSlot::EMPTY))
    }

    /// Iterate over occupied slots as `(handle, slot)` pairs.
    pub fn iter_occupied(&self) -> impl Iterator<Item = (Cap, &CapSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_empty())
            .map(|(i, s)| (Cap::from_raw(i as u32), s))
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_empty()).count()
    }
}

impl Default for CapTable {
    fn default() -> Self {
        Self::new()
    }
}
