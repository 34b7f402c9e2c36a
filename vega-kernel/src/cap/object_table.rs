//! Kernel object table
//!
//! The object table stores all kernel objects indexed by [`ObjectRef`].
//! It is protected by a single lock; callers access objects through
//! short-lived closures and must never nest accessor calls.
//!
//! # Design
//!
//! - Index 0 is reserved (NULL reference)
//! - Objects are stored in a flat array with a free list
//! - Generation counters prevent ABA problems across slot reuse
//! - Reference counts track how many capability slots name an object;
//!   an object is reclaimed when the last capability to it is freed

extern crate alloc;

use alloc::boxed::Box;
use spin::{Mutex, Once};

use vega_cap::{ObjectRef, ObjectType};

use crate::ipc::connection::Connection;
use crate::object::{CapGroupObject, ShmObject, ThreadObject};

/// Maximum number of kernel objects.
pub const MAX_OBJECTS: usize = 4096;

/// A kernel object.
///
/// Large objects are boxed so table entries stay small.
pub enum KernelObject {
    /// Process.
    CapGroup(Box<CapGroupObject>),
    /// Thread.
    Thread(Box<ThreadObject>),
    /// Shared-memory object.
    SharedMemory(ShmObject),
    /// IPC connection.
    Connection(Box<Connection>),
}

impl KernelObject {
    /// The capability-visible type of this object.
    #[must_use]
    pub fn obj_type(&self) -> ObjectType {
        match self {
            Self::CapGroup(_) => ObjectType::CapGroup,
            Self::Thread(_) => ObjectType::Thread,
            Self::SharedMemory(_) => ObjectType::SharedMemory,
            Self::Connection(_) => ObjectType::Connection,
        }
    }
}

/// One table entry: either an object or a link in the free list.
struct Entry {
    /// The stored object, `None` for free slots.
    obj: Option<KernelObject>,
    /// Next free index; meaningful only while `obj` is `None`.
    next_free: u32,
    /// Incremented on each reuse of the slot.
    generation: u16,
    /// Number of capability slots naming this object.
    ref_count: u32,
}

impl Entry {
    const fn free() -> Self {
        Self {
            obj: None,
            next_free: 0,
            generation: 0,
            ref_count: 0,
        }
    }
}

/// Object table storage.
pub struct ObjectTable {
    /// Entry array (boxed to keep it off the stack).
    entries: Box<[Entry]>,
    /// Head of the free list (index), 0 when exhausted.
    free_head: u32,
    /// Number of allocated objects.
    allocated: u32,
}

impl ObjectTable {
    fn new() -> Self {
        let mut entries: Box<[Entry]> = (0..MAX_OBJECTS).map(|_| Entry::free()).collect();

        // Build the free list; index 0 is NULL, so start at 1.
        for i in 1..MAX_OBJECTS - 1 {
            entries[i].next_free = (i + 1) as u32;
        }
        entries[MAX_OBJECTS - 1].next_free = 0;

        Self {
            entries,
            free_head: 1,
            allocated: 0,
        }
    }

    /// Allocate a slot for `obj`.
    ///
    /// The new object has reference count zero; installing a capability
    /// to it bumps the count.
    pub fn alloc(&mut self, obj: KernelObject) -> Option<ObjectRef> {
        if self.free_head == 0 {
            return None;
        }
        let index = self.free_head;
        let entry = &mut self.entries[index as usize];
        self.free_head = entry.next_free;

        entry.obj = Some(obj);
        entry.generation = entry.generation.wrapping_add(1);
        entry.ref_count = 0;
        self.allocated += 1;
        Some(ObjectRef::from_index(index))
    }

    /// Free a slot, returning the object it held.
    pub fn free(&mut self, obj_ref: ObjectRef) -> Option<KernelObject> {
        let index = obj_ref.index();
        if index == 0 || index as usize >= MAX_OBJECTS {
            return None;
        }
        let entry = &mut self.entries[index as usize];
        let obj = entry.obj.take()?;
        entry.next_free = self.free_head;
        self.free_head = index;
        self.allocated -= 1;
        Some(obj)
    }

    /// Get a reference to an object.
    #[inline]
    pub fn get(&self, obj_ref: ObjectRef) -> Option<&KernelObject> {
        let index = obj_ref.index() as usize;
        if index == 0 || index >= MAX_OBJECTS {
            return None;
        }
        self.entries[index].obj.as_ref()
    }

    /// Get a mutable reference to an object.
    #[inline]
    pub fn get_mut(&mut self, obj_ref: ObjectRef) -> Option<&mut KernelObject> {
        let index = obj_ref.index() as usize;
        if index == 0 || index >= MAX_OBJECTS {
            return None;
        }
        self.entries[index].obj.as_mut()
    }

    /// Increment the reference count of an object.
    pub fn inc_ref(&mut self, obj_ref: ObjectRef) {
        let index = obj_ref.index() as usize;
        if index != 0 && index < MAX_OBJECTS && self.entries[index].obj.is_some() {
            self.entries[index].ref_count += 1;
        }
    }

    /// Decrement the reference count of an object.
    ///
    /// Returns `true` if the count reached zero.
    pub fn dec_ref(&mut self, obj_ref: ObjectRef) -> bool {
        let index = obj_ref.index() as usize;
        if index != 0 && index < MAX_OBJECTS && self.entries[index].obj.is_some() {
            let entry = &mut self.entries[index];
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.ref_count == 0
        } else {
            false
        }
    }

    /// Read the reference count of an object.
    #[inline]
    pub fn ref_count(&self, obj_ref: ObjectRef) -> u32 {
        let index = obj_ref.index() as usize;
        if index != 0 && index < MAX_OBJECTS {
            self.entries[index].ref_count
        } else {
            0
        }
    }

    /// Number of allocated objects.
    #[inline]
    pub fn allocated(&self) -> u32 {
        self.allocated
    }
}

/// Global kernel object table.
static OBJECT_TABLE: Once<Mutex<ObjectTable>> = Once::new();

fn get_table() -> &'static Mutex<ObjectTable> {
    OBJECT_TABLE.call_once(|| {
        log::debug!("Object table initialised with {} slots", MAX_OBJECTS - 1);
        Mutex::new(ObjectTable::new())
    })
}

/// Initialise the global object table.
///
/// Called during kernel initialisation; subsequent calls are no-ops.
pub fn init() {
    let _ = get_table();
}

/// Allocate a new kernel object.
pub fn alloc(obj: KernelObject) -> Option<ObjectRef> {
    get_table().lock().alloc(obj)
}

/// Free a kernel object, dropping it.
pub fn free(obj_ref: ObjectRef) {
    let obj = get_table().lock().free(obj_ref);
    drop(obj);
}

/// Access the object table with a closure.
///
/// The closure runs with the table lock held; it must not call any other
/// accessor in this module.
pub fn with_table<F, R>(f: F) -> R
where
    F: FnOnce(&mut ObjectTable) -> R,
{
    f(&mut get_table().lock())
}

/// Access a thread with a closure (read-only).
///
/// Returns `None` if the reference is not a valid thread.
pub fn with_thread<F, R>(thread_ref: ObjectRef, f: F) -> Option<R>
where
    F: FnOnce(&ThreadObject) -> R,
{
    let table = get_table().lock();
    match table.get(thread_ref) {
        Some(KernelObject::Thread(t)) => Some(f(t)),
        _ => None,
    }
}

/// Access a thread with a closure (mutable).
pub fn with_thread_mut<F, R>(thread_ref: ObjectRef, f: F) -> Option<R>
where
    F: FnOnce(&mut ThreadObject) -> R,
{
    let mut table = get_table().lock();
    match table.get_mut(thread_ref) {
        Some(KernelObject::Thread(t)) => Some(f(t)),
        _ => None,
    }
}

/// Access a process with a closure (read-only).
pub fn with_cap_group<F, R>(group_ref: ObjectRef, f: F) -> Option<R>
where
    F: FnOnce(&CapGroupObject) -> R,
{
    let table = get_table().lock();
    match table.get(group_ref) {
        Some(KernelObject::CapGroup(g)) => Some(f(g)),
        _ => None,
    }
}

/// Access a process with a closure (mutable).
pub fn with_cap_group_mut<F, R>(group_ref: ObjectRef, f: F) -> Option<R>
where
    F: FnOnce(&mut CapGroupObject) -> R,
{
    let mut table = get_table().lock();
    match table.get_mut(group_ref) {
        Some(KernelObject::CapGroup(g)) => Some(f(g)),
        _ => None,
    }
}

/// Access a connection with a closure (read-only).
pub fn with_connection<F, R>(conn_ref: ObjectRef, f: F) -> Option<R>
where
    F: FnOnce(&Connection) -> R,
{
    let table = get_table().lock();
    match table.get(conn_ref) {
        Some(KernelObject::Connection(c)) => Some(f(c)),
        _ => None,
    }
}

/// Access a connection with a closure (mutable).
pub fn with_connection_mut<F, R>(conn_ref: ObjectRef, f: F) -> Option<R>
where
    F: FnOnce(&mut Connection) -> R,
{
    let mut table = get_table().lock();
    match table.get_mut(conn_ref) {
        Some(KernelObject::Connection(c)) => Some(f(c)),
        _ => None,
    }
}

/// Access a shared-memory object with a closure (read-only).
pub fn with_shm<F, R>(shm_ref: ObjectRef, f: F) -> Option<R>
where
    F: FnOnce(&ShmObject) -> R,
{
    let table = get_table().lock();
    match table.get(shm_ref) {
        Some(KernelObject::SharedMemory(s)) => Some(f(s)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vega_cap::Badge;

    #[test]
    fn test_alloc_get_free() {
        let group = KernelObject::CapGroup(Box::new(CapGroupObject::new(Badge::new(1), 1)));
        let obj_ref = alloc(group).unwrap();
        assert!(with_cap_group(obj_ref, |g| g.pid).is_some());
        free(obj_ref);
        assert!(with_cap_group(obj_ref, |g| g.pid).is_none());
    }

    #[test]
    fn test_type_checked_access() {
        let shm = KernelObject::SharedMemory(ShmObject::new(0x1000));
        let obj_ref = alloc(shm).unwrap();
        assert_eq!(with_shm(obj_ref, |s| s.size), Some(0x1000));
        assert!(with_thread(obj_ref, |_| ()).is_none());
        free(obj_ref);
    }

    #[test]
    fn test_refcounts() {
        let shm = KernelObject::SharedMemory(ShmObject::new(0x1000));
        let obj_ref = alloc(shm).unwrap();
        with_table(|t| {
            t.inc_ref(obj_ref);
            t.inc_ref(obj_ref);
            assert!(!t.dec_ref(obj_ref));
            assert!(t.dec_ref(obj_ref));
        });
        free(obj_ref);
    }

    #[test]
    fn test_null_ref_is_invalid() {
        assert!(with_thread(ObjectRef::NULL, |_| ()).is_none());
    }
}
