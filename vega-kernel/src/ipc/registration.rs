//! IPC registration protocol
//!
//! The two-phase handshake that binds a client to a server's declared
//! service: the server declares once (`register_server`), then each
//! client registration switches through the server's register thread
//! (`register_client` → `ipc_register_cb_return`) and returns to the
//! client with a fresh connection capability.
//!
//! The register thread serves one registration at a time, serialised by
//! its `register_lock`. The lock is acquired with a non-blocking try and
//! released by the register thread in a later syscall, so a contended
//! registration surfaces as `Retry` rather than blocking inside the
//! kernel.

use alloc::boxed::Box;

use vega_cap::{Cap, CapRights, ObjectRef, ObjectType};
use vega_common::VirtAddr;
use vega_syscall::ShmConfig;

use crate::cap::{self, object_table};
use crate::cap::object_table::KernelObject;
use crate::object::ThreadType;
use crate::sched::{self, Switched};
use crate::syscall::error::{SysError, SysResult};

use super::connection::{
    Connection, HandlerConfig, IpcConfig, RegisterCbConfig, ServerConfig, ShmDescriptor,
};

/// Declare an IPC service on the calling thread.
///
/// `ipc_routine` is the service entry the handler threads will execute;
/// it is not validated here, a server entering an illegal address only
/// kills itself. `register_thread_cap` must name a thread of type
/// `Register` in the caller's process. `destructor` is handed to every
/// handler config and runs in the server's exit routine when a client
/// process dies.
///
/// A server thread can declare at most one service: the second attempt
/// fails with `InvalidArg`.
pub fn sys_register_server(
    ipc_routine: VirtAddr,
    register_thread_cap: Cap,
    destructor: VirtAddr,
) -> SysResult<()> {
    let server = sched::current_thread();
    let group = sched::current_cap_group();

    let declared =
        object_table::with_thread(server, |t| !t.ipc_config.is_none()).ok_or(SysError::InvalidCap)?;
    if declared {
        log::debug!("a server thread can only invoke register_server once");
        return Err(SysError::InvalidArg);
    }

    let register_thread = cap::lookup(group, register_thread_cap, ObjectType::Thread)?;
    let (ttype, entry, stack) = object_table::with_thread(register_thread, |t| {
        (t.ttype, t.ctx.next_ip(), t.ctx.stack())
    })
    .ok_or(SysError::InvalidCap)?;
    if ttype != ThreadType::Register {
        log::debug!("register_server requires a register thread");
        return Err(SysError::InvalidArg);
    }

    // Record the register thread's initial PC/SP: it resumes from the
    // same entry for every registration it serves.
    object_table::with_thread_mut(register_thread, |t| {
        t.ipc_config = IpcConfig::RegisterCb(RegisterCbConfig::new(entry, stack, destructor));
    });

    // Publishing the server config last doubles as the "service is
    // declared" flag observed by register_client.
    object_table::with_thread_mut(server, |t| {
        t.ipc_config = IpcConfig::Server(ServerConfig {
            declared_ipc_routine: ipc_routine,
            register_thread,
        });
    });

    Ok(())
}

/// Results of building a connection, handed to the register thread.
struct ClientConnectionResult {
    client_conn_cap: Cap,
    server_conn_cap: Cap,
    server_shm_cap: Cap,
}

/// Create the connection object and install its capabilities on both
/// sides.
///
/// Only the client half is initialised here; the register thread fills in
/// the server half in [`sys_ipc_register_cb_return`].
fn create_connection(
    client: ObjectRef,
    client_group: ObjectRef,
    server_group: ObjectRef,
    shm_cap: Cap,
    shm_addr: VirtAddr,
) -> SysResult<ClientConnectionResult> {
    let shm_ref = cap::lookup(client_group, shm_cap, ObjectType::SharedMemory)?;
    let shm_size = object_table::with_shm(shm_ref, |s| s.size).ok_or(SysError::InvalidCap)?;

    // Copy the shm capability to the server. The client allocated the
    // region, so the memory stays accounted to the client.
    let server_shm_cap = cap::cap_copy(
        client_group,
        server_group,
        shm_cap,
        CapRights::ALL,
        CapRights::NONE,
    )?;

    let (badge, pid) = object_table::with_cap_group(client_group, |g| (g.badge, g.pid))
        .ok_or(SysError::InvalidCap)?;

    let conn = Connection::new(
        client,
        badge,
        pid,
        ShmDescriptor {
            client_uaddr: shm_addr,
            server_uaddr: VirtAddr::new(0),
            size: shm_size,
            cap_in_client: shm_cap,
            cap_in_server: server_shm_cap,
        },
    );

    let Some(conn_ref) = object_table::alloc(KernelObject::Connection(Box::new(conn))) else {
        let _ = cap::cap_free(server_group, server_shm_cap);
        return Err(SysError::NoMemory);
    };

    let client_conn_cap = match cap::cap_alloc(client_group, conn_ref, CapRights::ALL) {
        Ok(c) => c,
        Err(e) => {
            object_table::free(conn_ref);
            let _ = cap::cap_free(server_group, server_shm_cap);
            return Err(e);
        }
    };

    let server_conn_cap = match cap::cap_copy(
        client_group,
        server_group,
        client_conn_cap,
        CapRights::ALL,
        CapRights::NONE,
    ) {
        Ok(c) => c,
        Err(e) => {
            // Freeing the only capability also reclaims the object.
            let _ = cap::cap_free(client_group, client_conn_cap);
            let _ = cap::cap_free(server_group, server_shm_cap);
            return Err(e);
        }
    };

    Ok(ClientConnectionResult {
        client_conn_cap,
        server_conn_cap,
        server_shm_cap,
    })
}

/// Register the calling client with a declared service.
///
/// On success this call does not return to the caller: the client blocks
/// and control moves straight into the server's register thread, which
/// delivers the connection capability into the client's return register
/// when it approves the registration.
///
/// Fails with `Retry` if the service is not yet declared or another
/// registration is in progress; the client's runtime re-issues the call.
pub fn sys_register_client(server_cap: Cap, shm_config: ShmConfig) -> Result<Switched, SysError> {
    let client = sched::current_thread();
    let client_group = sched::current_cap_group();

    let server = cap::lookup(client_group, server_cap, ObjectType::Thread)?;
    let declared = object_table::with_thread(server, |t| {
        t.ipc_config
            .server()
            .map(|c| (c.declared_ipc_routine, c.register_thread))
    })
    .ok_or(SysError::InvalidCap)?;
    // The server has not finished register_server yet; try again later.
    let Some((declared_routine, register_thread)) = declared else {
        return Err(SysError::Retry);
    };

    // One registration at a time. The unlock is done by the register
    // thread in ipc_register_cb_return, so only a try-lock is safe here.
    let locked = object_table::with_thread(register_thread, |t| {
        t.ipc_config.register_cb().map(|c| c.register_lock.try_lock())
    })
    .ok_or(SysError::InvalidCap)?
    .ok_or(SysError::InvalidCap)?;
    if !locked {
        return Err(SysError::Retry);
    }

    match register_client_locked(
        client,
        client_group,
        server,
        register_thread,
        declared_routine,
        shm_config,
    ) {
        Ok(switched) => Ok(switched),
        Err(e) => {
            object_table::with_thread(register_thread, |t| {
                if let Some(c) = t.ipc_config.register_cb() {
                    c.register_lock.unlock();
                }
            });
            Err(e)
        }
    }
}

/// The part of `register_client` that runs with `register_lock` held.
fn register_client_locked(
    client: ObjectRef,
    client_group: ObjectRef,
    server: ObjectRef,
    register_thread: ObjectRef,
    declared_routine: VirtAddr,
    shm_config: ShmConfig,
) -> Result<Switched, SysError> {
    let server_group =
        object_table::with_thread(server, |t| t.cap_group).ok_or(SysError::InvalidCap)?;

    // Validate the user-supplied descriptor and map the region in the
    // client address space.
    let shm_cap = Cap::from_raw(shm_config.shm_cap as u32);
    let shm_ref = cap::lookup(client_group, shm_cap, ObjectType::SharedMemory)?;
    let shm_size = object_table::with_shm(shm_ref, |s| s.size).ok_or(SysError::InvalidCap)?;
    object_table::with_cap_group_mut(client_group, |g| {
        g.vmspace.map_shm(shm_config.shm_addr, shm_size, shm_ref)
    })
    .ok_or(SysError::InvalidCap)?
    .map_err(|()| SysError::InvalidArg)?;

    let res = match create_connection(
        client,
        client_group,
        server_group,
        shm_cap,
        shm_config.shm_addr,
    ) {
        Ok(res) => res,
        Err(e) => {
            object_table::with_cap_group_mut(client_group, |g| {
                g.vmspace.unmap_range(shm_config.shm_addr, shm_size)
            });
            return Err(e);
        }
    };

    // Hand the in-progress connection to the register thread.
    object_table::with_thread_mut(register_thread, |t| {
        if let Some(c) = t.ipc_config.register_cb_mut() {
            c.conn_cap_in_client = res.client_conn_cap;
            c.conn_cap_in_server = res.server_conn_cap;
            c.shm_cap_in_server = res.server_shm_cap;
        }
    });

    // Block the client and switch into the register thread at its
    // recorded entry, on the client's scheduling context.
    sched::thread_set_ts_blocking(client);
    let donated = object_table::with_thread(client, |t| t.sc).ok_or(SysError::InvalidCap)?;
    object_table::with_thread_mut(register_thread, |t| {
        let (entry, stack) = match t.ipc_config.register_cb() {
            Some(c) => (c.entry, c.stack),
            None => unreachable!("register thread lost its config while locked"),
        };
        t.ctx.set_stack(stack);
        t.ctx.set_next_ip(entry);
        t.ctx.set_arg0(declared_routine.as_u64());
        t.sc = donated;
    });

    log::trace!(
        "registration: client {client:?} -> register thread {register_thread:?}"
    );
    Ok(sched::sched_to_thread(register_thread))
}

/// Complete a pending registration.
///
/// Invoked by the register thread. Names the handler thread that will
/// serve the new connection, maps the shared region on the server side
/// and switches back to the blocked client with the connection capability
/// as its return value.
///
/// The handler thread's config is initialised lazily on first use, so a
/// server may point many clients at one handler thread.
pub fn sys_ipc_register_cb_return(
    handler_thread_cap: Cap,
    exit_routine: VirtAddr,
    server_shm_addr: VirtAddr,
) -> Result<Switched, SysError> {
    let caller = sched::current_thread();
    let server_group = sched::current_cap_group();

    struct Pending {
        conn_cap_in_client: Cap,
        conn_cap_in_server: Cap,
        shm_cap_in_server: Cap,
        destructor: VirtAddr,
    }

    let pending = object_table::with_thread(caller, |t| {
        t.ipc_config.register_cb().map(|c| Pending {
            conn_cap_in_client: c.conn_cap_in_client,
            conn_cap_in_server: c.conn_cap_in_server,
            shm_cap_in_server: c.shm_cap_in_server,
            destructor: c.destructor,
        })
    })
    .ok_or(SysError::InvalidCap)?
    .ok_or(SysError::InvalidCap)?;

    let conn_ref = cap::lookup(server_group, pending.conn_cap_in_server, ObjectType::Connection)?;
    let handler = cap::lookup(server_group, handler_thread_cap, ObjectType::Thread)?;

    // Map the connection's shm in the server address space.
    let shm_ref = cap::lookup(server_group, pending.shm_cap_in_server, ObjectType::SharedMemory)?;
    let shm_size = object_table::with_shm(shm_ref, |s| s.size).ok_or(SysError::InvalidCap)?;
    object_table::with_cap_group_mut(server_group, |g| {
        g.vmspace.map_shm(server_shm_addr, shm_size, shm_ref)
    })
    .ok_or(SysError::InvalidCap)?
    .map_err(|()| SysError::InvalidArg)?;

    // The server has approved: deliver the connection capability to the
    // client that started this registration.
    let client = object_table::with_connection(conn_ref, |c| c.current_client_thread)
        .ok_or(SysError::InvalidCap)?;
    object_table::with_thread_mut(client, |t| {
        t.ctx.set_return(pending.conn_cap_in_client.raw() as u64)
    });

    // First use of this handler thread: record its entry PC/SP. Skipped
    // when the thread already serves other connections.
    object_table::with_thread_mut(handler, |t| {
        if t.ipc_config.is_none() {
            let entry = t.ctx.next_ip();
            let stack = t.ctx.stack();
            t.ipc_config = IpcConfig::Handler(HandlerConfig::new(
                entry,
                stack,
                exit_routine,
                pending.destructor,
            ));
        }
    });

    object_table::with_connection_mut(conn_ref, |c| {
        c.server_handler_thread = handler;
        c.shm.server_uaddr = server_shm_addr;
        c.conn_cap_in_client = pending.conn_cap_in_client;
        c.conn_cap_in_server = pending.conn_cap_in_server;
        c.state = super::connection::ConnState::Valid;
        c.current_client_thread = ObjectRef::NULL;
    });

    // Park the register thread for the next registration and give the
    // donated scheduling context back by switching to the client.
    sched::thread_set_ts_waiting(caller);
    object_table::with_thread(caller, |t| {
        if let Some(c) = t.ipc_config.register_cb() {
            c.register_lock.unlock();
        }
    });
    object_table::with_thread_mut(caller, |t| t.sc = None);

    log::trace!("registration complete: connection {conn_ref:?} -> client {client:?}");
    Ok(sched::sched_to_thread(client))
}
