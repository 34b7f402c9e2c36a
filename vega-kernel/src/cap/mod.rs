//! Capability operations
//!
//! Kernel-side operations on per-process capability tables: resolving a
//! handle to an object, installing a capability, copying one between two
//! processes and freeing one. The table lock is taken only briefly for
//! each operation; higher-level IPC locks serialise the protocols built
//! on top.

pub mod object_table;

use vega_cap::{Cap, CapRights, CapSlot, ObjectRef, ObjectType};

use crate::syscall::error::{SysError, SysResult};
use object_table::KernelObject;

/// Resolve `cap` in `group`'s table, checking the object type.
pub fn lookup(group_ref: ObjectRef, cap: Cap, expected: ObjectType) -> SysResult<ObjectRef> {
    object_table::with_cap_group(group_ref, |g| {
        g.table.get_typed(cap, expected).map_err(SysError::from)
    })
    .ok_or(SysError::InvalidCap)?
}

/// Install a capability to `object` in `group`'s table.
///
/// Bumps the object's reference count.
pub fn cap_alloc(group_ref: ObjectRef, object: ObjectRef, rights: CapRights) -> SysResult<Cap> {
    object_table::with_table(|t| {
        let obj_type = t.get(object).map(KernelObject::obj_type).ok_or(SysError::InvalidCap)?;
        let slot = CapSlot::new(object, obj_type, rights);
        let cap = match t.get_mut(group_ref) {
            Some(KernelObject::CapGroup(g)) => g.table.alloc(slot).map_err(SysError::from)?,
            _ => return Err(SysError::InvalidCap),
        };
        t.inc_ref(object);
        Ok(cap)
    })
}

/// Copy the capability `cap` from `src_group` into `dst_group`.
///
/// The copy's rights are `(source ∩ mask) ∪ rest`; `rest` must be a
/// subset of the source rights (rights are never escalated).
pub fn cap_copy(
    src_group: ObjectRef,
    dst_group: ObjectRef,
    cap: Cap,
    mask: CapRights,
    rest: CapRights,
) -> SysResult<Cap> {
    object_table::with_table(|t| {
        let slot = match t.get(src_group) {
            Some(KernelObject::CapGroup(g)) => *g.table.get(cap).map_err(SysError::from)?,
            _ => return Err(SysError::InvalidCap),
        };
        if !rest.is_subset_of(slot.rights()) {
            return Err(SysError::NoRights);
        }
        let new_slot = CapSlot::new(
            slot.object(),
            slot.obj_type(),
            slot.rights().attenuate(mask, rest),
        );
        let new_cap = match t.get_mut(dst_group) {
            Some(KernelObject::CapGroup(g)) => g.table.alloc(new_slot).map_err(SysError::from)?,
            _ => return Err(SysError::InvalidCap),
        };
        t.inc_ref(slot.object());
        Ok(new_cap)
    })
}

/// Free the capability `cap` in `group`'s table.
///
/// Drops the object's reference count; the object is reclaimed when the
/// last capability naming it is freed.
pub fn cap_free(group_ref: ObjectRef, cap: Cap) -> SysResult<()> {
    object_table::with_table(|t| {
        let slot = match t.get_mut(group_ref) {
            Some(KernelObject::CapGroup(g)) => g.table.remove(cap).map_err(SysError::from)?,
            _ => return Err(SysError::InvalidCap),
        };
        let object = slot.object();
        if t.dec_ref(object) {
            log::trace!("freeing object {object:?} (last cap dropped)");
            let obj = t.free(object);
            drop(obj);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use vega_cap::Badge;

    use crate::object::{CapGroupObject, ShmObject};

    fn make_group(badge: u64, pid: i32) -> ObjectRef {
        object_table::alloc(KernelObject::CapGroup(Box::new(CapGroupObject::new(
            Badge::new(badge),
            pid,
        ))))
        .unwrap()
    }

    #[test]
    fn test_alloc_lookup_free() {
        let group = make_group(0x11, 1);
        let shm = object_table::alloc(KernelObject::SharedMemory(ShmObject::new(0x1000))).unwrap();

        let cap = cap_alloc(group, shm, CapRights::ALL).unwrap();
        assert_eq!(lookup(group, cap, ObjectType::SharedMemory).unwrap(), shm);
        assert_eq!(
            lookup(group, cap, ObjectType::Thread),
            Err(SysError::InvalidCap)
        );

        cap_free(group, cap).unwrap();
        // Last capability dropped: the object is gone.
        assert!(object_table::with_shm(shm, |_| ()).is_none());
        object_table::free(group);
    }

    #[test]
    fn test_copy_keeps_object_alive() {
        let src = make_group(0x21, 2);
        let dst = make_group(0x22, 3);
        let shm = object_table::alloc(KernelObject::SharedMemory(ShmObject::new(0x2000))).unwrap();

        let cap = cap_alloc(src, shm, CapRights::ALL).unwrap();
        let copied = cap_copy(src, dst, cap, CapRights::ALL, CapRights::NONE).unwrap();
        assert_eq!(lookup(dst, copied, ObjectType::SharedMemory).unwrap(), shm);

        cap_free(src, cap).unwrap();
        assert!(object_table::with_shm(shm, |_| ()).is_some());
        cap_free(dst, copied).unwrap();
        assert!(object_table::with_shm(shm, |_| ()).is_none());

        object_table::free(src);
        object_table::free(dst);
    }

    #[test]
    fn test_copy_cannot_escalate() {
        let src = make_group(0x31, 4);
        let dst = make_group(0x32, 5);
        let shm = object_table::alloc(KernelObject::SharedMemory(ShmObject::new(0x1000))).unwrap();

        let cap = cap_alloc(src, shm, CapRights::READ).unwrap();
        assert_eq!(
            cap_copy(src, dst, cap, CapRights::ALL, CapRights::WRITE),
            Err(SysError::NoRights)
        );
        // Attenuation within the source rights is fine.
        let copied = cap_copy(src, dst, cap, CapRights::READ, CapRights::NONE).unwrap();
        assert!(copied.raw() < vega_cap::MAX_CAPS as u32);

        cap_free(src, cap).unwrap();
        cap_free(dst, copied).unwrap();
        object_table::free(src);
        object_table::free(dst);
    }
}
