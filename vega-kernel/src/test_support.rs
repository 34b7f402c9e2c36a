//! Shared fixtures for kernel tests
//!
//! Builds processes, threads and declared services on the global object
//! table and drives the registration handshake the way a userspace
//! runtime would. Tests that touch the global kernel state serialise on
//! [`kernel_lock`] since the object table, scheduler state and run queue
//! are shared across the test process.

use std::sync::{Mutex, MutexGuard, OnceLock};

use alloc::boxed::Box;

use vega_cap::{Badge, Cap, CapRights, ObjectRef};
use vega_common::VirtAddr;
use vega_syscall::ShmConfig;

use crate::cap::{self, object_table};
use crate::cap::object_table::KernelObject;
use crate::ipc::registration::{sys_ipc_register_cb_return, sys_register_client, sys_register_server};
use crate::object::{CapGroupObject, ShmObject, ThreadObject, ThreadType};
use crate::sched::{self, context::ArchContext};

/// Well-known addresses used by the fixtures.
pub(crate) const IPC_ROUTINE: u64 = 0x0040_0000;
pub(crate) const REGISTER_ENTRY: u64 = 0x0041_0000;
pub(crate) const HANDLER_ENTRY: u64 = 0x0042_0000;
pub(crate) const EXIT_ROUTINE: u64 = 0x0043_0000;
pub(crate) const DESTRUCTOR: u64 = 0x0044_0000;
pub(crate) const STACK_TOP: u64 = 0x0100_0000;

static KERNEL_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Serialise tests that touch the global kernel state.
pub(crate) fn kernel_lock() -> MutexGuard<'static, ()> {
    let guard = KERNEL_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    sched::reset_run_queue();
    guard
}

/// Create a process with the given identity.
pub(crate) fn make_process(badge: u64, pid: i32) -> ObjectRef {
    object_table::alloc(KernelObject::CapGroup(Box::new(CapGroupObject::new(
        Badge::new(badge),
        pid,
    ))))
    .expect("object table full")
}

/// Create a thread in `group` with the given entry state and install a
/// capability to it in the group's table.
pub(crate) fn spawn_thread(
    group: ObjectRef,
    ttype: ThreadType,
    entry: u64,
    stack: u64,
) -> (ObjectRef, Cap) {
    let thread = ThreadObject::new(
        group,
        ttype,
        ArchContext::new(VirtAddr::new(entry), VirtAddr::new(stack)),
    );
    let thread_ref = object_table::alloc(KernelObject::Thread(Box::new(thread)))
        .expect("object table full");
    object_table::with_cap_group_mut(group, |g| g.threads.push(thread_ref));
    let cap = cap::cap_alloc(group, thread_ref, CapRights::ALL).expect("cap table full");
    (thread_ref, cap)
}

/// Create a shared-memory object and install a capability in `group`.
pub(crate) fn make_shm(group: ObjectRef, size: usize) -> Cap {
    let shm_ref = object_table::alloc(KernelObject::SharedMemory(ShmObject::new(size)))
        .expect("object table full");
    cap::cap_alloc(group, shm_ref, CapRights::ALL).expect("cap table full")
}

/// Copy a capability from `src` into `dst` with unchanged rights.
pub(crate) fn grant(src: ObjectRef, dst: ObjectRef, cap: Cap) -> Cap {
    cap::cap_copy(src, dst, cap, CapRights::ALL, CapRights::NONE).expect("cap copy failed")
}

/// Make `thread` the running thread, as if the scheduler picked it.
pub(crate) fn run_as(thread: ObjectRef) {
    sched::set_current_thread(thread);
}

/// A server process with a declared service.
pub(crate) struct Service {
    pub server_group: ObjectRef,
    pub server_thread: ObjectRef,
    pub server_thread_cap: Cap,
    pub register_thread: ObjectRef,
    pub handler_thread: ObjectRef,
    pub handler_cap: Cap,
}

/// Build a server process and declare a service on it.
pub(crate) fn setup_service(badge: u64, pid: i32) -> Service {
    let server_group = make_process(badge, pid);
    let (server_thread, server_thread_cap) =
        spawn_thread(server_group, ThreadType::User, IPC_ROUTINE, STACK_TOP);
    let (register_thread, register_cap) = spawn_thread(
        server_group,
        ThreadType::Register,
        REGISTER_ENTRY,
        STACK_TOP + 0x1000,
    );
    let (handler_thread, handler_cap) = spawn_thread(
        server_group,
        ThreadType::Shadow,
        HANDLER_ENTRY,
        STACK_TOP + 0x2000,
    );

    run_as(server_thread);
    sys_register_server(
        VirtAddr::new(IPC_ROUTINE),
        register_cap,
        VirtAddr::new(DESTRUCTOR),
    )
    .expect("register_server failed");

    Service {
        server_group,
        server_thread,
        server_thread_cap,
        register_thread,
        handler_thread,
        handler_cap,
    }
}

/// A client process with one thread and a shared-memory object.
pub(crate) struct Client {
    pub group: ObjectRef,
    pub thread: ObjectRef,
    pub shm_cap: Cap,
}

/// Build a client process holding a `shm_size` shared-memory object.
pub(crate) fn setup_client(badge: u64, pid: i32, shm_size: usize) -> Client {
    let group = make_process(badge, pid);
    let (thread, _) = spawn_thread(group, ThreadType::User, 0x0050_0000, STACK_TOP + 0x3000);
    let shm_cap = make_shm(group, shm_size);
    Client {
        group,
        thread,
        shm_cap,
    }
}

/// Drive a full registration handshake for `client` against `service`.
///
/// Returns the connection capability delivered into the client's return
/// register.
pub(crate) fn register_connection(
    service: &Service,
    client: &Client,
    client_shm_addr: u64,
    server_shm_addr: u64,
) -> Cap {
    let server_cap = grant(service.server_group, client.group, service.server_thread_cap);

    run_as(client.thread);
    let switched = sys_register_client(
        server_cap,
        ShmConfig {
            shm_cap: client.shm_cap.raw() as u64,
            shm_addr: VirtAddr::new(client_shm_addr),
        },
    )
    .expect("register_client failed");
    drop(switched);
    assert_eq!(sched::current_thread(), service.register_thread);

    // Now acting as the register thread: approve the registration.
    let switched = sys_ipc_register_cb_return(
        service.handler_cap,
        VirtAddr::new(EXIT_ROUTINE),
        VirtAddr::new(server_shm_addr),
    )
    .expect("register_cb_return failed");
    drop(switched);
    assert_eq!(sched::current_thread(), client.thread);

    let raw = object_table::with_thread(client.thread, |t| t.ctx.return_value()).unwrap();
    Cap::from_raw(raw as u32)
}
