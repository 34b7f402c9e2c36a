//! Capability slot storage
//!
//! A capability slot is the fundamental unit of capability storage. Each
//! slot holds exactly one capability or is empty. Slots are organised into
//! a flat per-process [`CapTable`](crate::CapTable).

use core::fmt;

use crate::CapRights;

/// Object reference - kernel-internal index to the actual object.
///
/// This is an index into the kernel's object table, not a raw pointer.
/// Using indices provides several benefits:
///
/// - **Bounds checking**: Index can be validated against table size
/// - **Teardown safety**: Clearing a table entry invalidates all references
/// - **Compact**: 32 bits is sufficient
/// - **No pointer provenance issues**: Simpler unsafe code
///
/// # Null Reference
///
/// An `ObjectRef` of zero (`ObjectRef::NULL`) indicates no object is
/// referenced. This is used for empty capability slots and for relation
/// fields that are currently unset (e.g. a connection with no active
/// client thread).
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(u32);

impl ObjectRef {
    /// Null reference (no object).
    pub const NULL: Self = Self(0);

    /// Create an object reference from a raw index.
    ///
    /// # Note
    ///
    /// Index 0 is reserved for NULL. Valid object indices start at 1.
    #[inline]
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// Get the raw index value.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    /// Check if this is a null reference.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check if this is a valid (non-null) reference.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ObjectRef::NULL")
        } else {
            write!(f, "ObjectRef({})", self.0)
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Object type discriminant.
///
/// Identifies the type of kernel object that a capability refers to.
/// It is stored as a single byte in the capability slot so lookups can
/// type-check a handle without touching the object table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ObjectType {
    /// Empty slot (no capability).
    #[default]
    Empty = 0,
    /// Process (capability group).
    CapGroup = 1,
    /// Thread.
    Thread = 2,
    /// Shared-memory object.
    SharedMemory = 3,
    /// IPC connection.
    Connection = 4,
}

/// A single capability: object reference, type and rights.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CapSlot {
    /// Referenced object.
    object: ObjectRef,
    /// Type of the referenced object.
    obj_type: ObjectType,
    /// Rights this capability carries.
    rights: CapRights,
}

impl CapSlot {
    /// An empty slot.
    pub const EMPTY: Self = Self {
        object: ObjectRef::NULL,
        obj_type: ObjectType::Empty,
        rights: CapRights::NONE,
    };

    /// Create a slot holding a capability to `object`.
    #[inline]
    #[must_use]
    pub const fn new(object: ObjectRef, obj_type: ObjectType, rights: CapRights) -> Self {
        Self {
            object,
            obj_type,
            rights,
        }
    }

    /// Check if this slot holds no capability.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.object.is_null()
    }

    /// Get the referenced object.
    #[inline]
    #[must_use]
    pub const fn object(&self) -> ObjectRef {
        self.object
    }

    /// Get the object type.
    #[inline]
    #[must_use]
    pub const fn obj_type(&self) -> ObjectType {
        self.obj_type
    }

    /// Get the rights.
    #[inline]
    #[must_use]
    pub const fn rights(&self) -> CapRights {
        self.rights
    }
}
