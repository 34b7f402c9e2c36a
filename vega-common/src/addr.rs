//! Virtual Address Type
//!
//! A simple address newtype used in ABI structures and kernel objects:
//! shared-memory bases, recorded entry points and stack pointers.
//!
//! # Design
//!
//! The type is an intentionally simple `#[repr(transparent)]` wrapper
//! around `u64`:
//! - Zero runtime overhead
//! - Safe to transmute to/from `u64` for the syscall ABI
//! - Compatible with `#[repr(C)]` structs

use core::fmt;

/// Virtual memory address.
///
/// Represents an address in a user address space: the base of a mapped
/// shared-memory region, or a thread's program counter / stack pointer
/// as recorded in its register context.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    /// Create a new virtual address.
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this address is null (zero).
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check if this address is page-aligned (4KB).
    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & 0xFFF == 0
    }

    /// Add an offset to this address.
    #[inline]
    #[must_use]
    pub const fn offset(self, offset: u64) -> Self {
        Self(self.0.wrapping_add(offset))
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for VirtAddr {
    #[inline]
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<VirtAddr> for u64 {
    #[inline]
    fn from(addr: VirtAddr) -> Self {
        addr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virt_addr_basics() {
        let addr = VirtAddr::new(0x5000_0000);
        assert_eq!(addr.as_u64(), 0x5000_0000);
        assert!(!addr.is_null());
        assert!(addr.is_page_aligned());
        assert!(VirtAddr::new(0).is_null());
    }

    #[test]
    fn test_virt_addr_offset() {
        let addr = VirtAddr::new(0x1000);
        assert_eq!(addr.offset(0x20).as_u64(), 0x1020);
    }
}
