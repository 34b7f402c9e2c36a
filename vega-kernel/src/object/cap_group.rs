//! Process objects
//!
//! A capability group is Vega's process: the unit of protection that owns
//! a capability table, an address space and a set of threads. Connections
//! are established between two cap groups; any thread of the client group
//! may use a connection held in its table.

use alloc::vec::Vec;

use vega_cap::{Badge, CapTable, ObjectRef};
use vega_common::VirtAddr;

/// One region mapped in a process's address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmMapping {
    /// Base address of the mapping.
    pub addr: VirtAddr,
    /// Size in bytes.
    pub size: usize,
    /// The backing shared-memory object.
    pub shm: ObjectRef,
}

/// A process's address-space mappings.
///
/// Only shared-memory regions are tracked here; the page-table machinery
/// behind the mappings belongs to the memory subsystem.
#[derive(Default)]
pub struct Vmspace {
    mappings: Vec<VmMapping>,
}

impl Vmspace {
    /// Create an empty address space.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mappings: Vec::new(),
        }
    }

    /// Map `shm` at `addr`. Fails if the range overlaps an existing
    /// mapping or the address is not page-aligned.
    pub fn map_shm(&mut self, addr: VirtAddr, size: usize, shm: ObjectRef) -> Result<(), ()> {
        if addr.is_null() || !addr.is_page_aligned() || size == 0 {
            return Err(());
        }
        let end = addr.as_u64().checked_add(size as u64).ok_or(())?;
        for m in &self.mappings {
            let m_end = m.addr.as_u64() + m.size as u64;
            if addr.as_u64() < m_end && m.addr.as_u64() < end {
                return Err(());
            }
        }
        self.mappings.push(VmMapping { addr, size, shm });
        Ok(())
    }

    /// Remove the mapping starting at `addr` with the given size.
    ///
    /// Returns `true` if a mapping was removed.
    pub fn unmap_range(&mut self, addr: VirtAddr, size: usize) -> bool {
        let before = self.mappings.len();
        self.mappings.retain(|m| !(m.addr == addr && m.size == size));
        self.mappings.len() != before
    }

    /// Look up the mapping starting at `addr`.
    #[must_use]
    pub fn lookup(&self, addr: VirtAddr) -> Option<&VmMapping> {
        self.mappings.iter().find(|m| m.addr == addr)
    }

    /// Number of mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Check if there are no mappings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// Process object: badge, capability table, address space, threads.
pub struct CapGroupObject {
    /// Immutable process identity, stamped into connections.
    pub badge: Badge,
    /// Process id, recorded alongside the badge.
    pub pid: i32,
    /// The process's capability table.
    pub table: CapTable,
    /// Shared-memory mappings.
    pub vmspace: Vmspace,
    /// Threads belonging to this process.
    pub threads: Vec<ObjectRef>,
}

impl CapGroupObject {
    /// Create a process with the given identity.
    #[must_use]
    pub fn new(badge: Badge, pid: i32) -> Self {
        Self {
            badge,
            pid,
            table: CapTable::new(),
            vmspace: Vmspace::new(),
            threads: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rejects_overlap() {
        let mut vm = Vmspace::new();
        let shm = ObjectRef::from_index(1);
        vm.map_shm(VirtAddr::new(0x5000_0000), 0x2000, shm).unwrap();
        assert!(vm.map_shm(VirtAddr::new(0x5000_1000), 0x1000, shm).is_err());
        assert!(vm.map_shm(VirtAddr::new(0x5000_2000), 0x1000, shm).is_ok());
    }

    #[test]
    fn test_map_rejects_unaligned() {
        let mut vm = Vmspace::new();
        let shm = ObjectRef::from_index(1);
        assert!(vm.map_shm(VirtAddr::new(0x5000_0010), 0x1000, shm).is_err());
        assert!(vm.map_shm(VirtAddr::new(0), 0x1000, shm).is_err());
    }

    #[test]
    fn test_unmap() {
        let mut vm = Vmspace::new();
        let shm = ObjectRef::from_index(1);
        vm.map_shm(VirtAddr::new(0x5000_0000), 0x1000, shm).unwrap();
        assert!(vm.unmap_range(VirtAddr::new(0x5000_0000), 0x1000));
        assert!(!vm.unmap_range(VirtAddr::new(0x5000_0000), 0x1000));
        assert!(vm.is_empty());
    }
}
