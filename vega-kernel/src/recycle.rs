//! Connection and process recycling
//!
//! A connection is *asymmetrically* shared: when it is active the client
//! and the server invoke it in different ways, so each side has its own
//! teardown obligations. Plain reference counting only handles
//! symmetrically shared objects, so the connection carries a sub-state
//! machine on top of the capability system's free:
//!
//! ```text
//! Valid ──ownership lock──▶ IncomeStopped ──handler IPC lock──▶
//! RecycleReady ──side-specific teardown──▶ DeinitReady ──▶ freed
//! ```
//!
//! Every transition is attempted by a retryable step: a lock that is
//! currently held elsewhere yields `Retry` instead of blocking, which is
//! what lets a process-wide sweep make forward progress without kernel
//! deadlock — the whole sweep is simply re-issued until every step has
//! gone through.
//!
//! The client side must additionally force the server's handler thread
//! through its exit routine, so per-client state the server allocated is
//! cleaned up. A server cannot unilaterally close a connection mid-flight,
//! so the server side only detaches itself and leaves the rest to the
//! eventual client-side step.

use alloc::vec::Vec;

use vega_cap::{Cap, ObjectRef, ObjectType};

use crate::cap::{self, object_table};
use crate::ipc::connection::ConnState;
use crate::object::{ExitState, SchedContext, ThreadType};
use crate::sched;
use crate::syscall::error::{SysError, SysResult};

/// Advance a connection towards `RecycleReady`.
///
/// Each step is idempotent: re-running a step that already completed is
/// a no-op, which is what makes the sweep safely retryable after an
/// earlier `Retry`.
pub fn stop_connection(conn_ref: ObjectRef) -> SysResult<()> {
    // Valid -> IncomeStopped: taking the ownership lock waits out any
    // in-flight call; once the state flips, new calls are declined in
    // ipc_call and the connection will not be used again.
    let stopped = object_table::with_connection_mut(conn_ref, |c| {
        if c.state == ConnState::Valid {
            if !c.ownership.try_lock() {
                return Err(SysError::Retry);
            }
            c.state = ConnState::IncomeStopped;
        }
        Ok(())
    })
    .ok_or(SysError::InvalidCap)?;
    stopped?;

    // IncomeStopped -> RecycleReady: also grab the handler thread's IPC
    // lock so no other client can invoke it while its exit routine runs.
    // The exit routine releases it via ipc_exit_routine_return. A third
    // state is needed here because a binary valid/invalid flag could not
    // tell whether *both* locks were already grabbed when the sweep is
    // retried after an earlier Retry.
    let (state, handler) =
        object_table::with_connection(conn_ref, |c| (c.state, c.server_handler_thread))
            .ok_or(SysError::InvalidCap)?;
    if state == ConnState::IncomeStopped {
        if handler.is_valid() {
            let locked = object_table::with_thread(handler, |t| {
                t.ipc_config.handler().map(|h| h.ipc_lock.try_lock())
            });
            match locked {
                Some(Some(true)) => {}
                Some(Some(false)) => return Err(SysError::Retry),
                // Registration never completed; there is no handler
                // state to lock.
                _ => {}
            }
        }
        object_table::with_connection_mut(conn_ref, |c| c.state = ConnState::RecycleReady);
    }

    Ok(())
}

/// Enter the handler thread's exit routine so server-side per-client
/// state is cleaned up, or mark it exited if it cannot run one.
///
/// `recycle_client_state` selects whether the routine receives the
/// destructor recorded at service declaration: it does only when the
/// whole client process exited, not on a single-connection close.
fn recycle_server_shadow_thread(
    conn_ref: ObjectRef,
    server_thread: ObjectRef,
    recycle_client_state: bool,
) {
    let config = object_table::with_thread(server_thread, |t| {
        t.ipc_config
            .handler()
            .map(|h| (h.exit_routine, h.stack, h.destructor))
    })
    .flatten();
    let Some((exit_routine, stack, destructor)) = config else {
        sched::thread_set_exited(server_thread);
        return;
    };

    let runnable = object_table::with_thread(server_thread, |t| {
        t.exit_state == ExitState::Running
    })
    .unwrap_or(false);

    if exit_routine.is_null() || !runnable {
        // The thread will never be scheduled again; record that.
        sched::thread_set_exited(server_thread);
        return;
    }

    let (badge, server_uaddr, shm_size) = match object_table::with_connection(conn_ref, |c| {
        (c.client_badge, c.shm.server_uaddr, c.shm.size)
    }) {
        Some(v) => v,
        None => return,
    };

    object_table::with_thread_mut(server_thread, |t| {
        assert!(
            t.sc.is_none(),
            "handler thread still carries a donated scheduling context"
        );
        // The exit routine runs on a kernel-granted context; there is no
        // client left to donate one.
        t.sc = Some(SchedContext::default());
        t.ctx.set_next_ip(exit_routine);
        t.ctx.set_stack(stack);
        t.ctx.set_arg0(if recycle_client_state {
            destructor.as_u64()
        } else {
            0
        });
        t.ctx.set_arg1(badge.value());
        t.ctx.set_arg2(server_uaddr.as_u64());
        t.ctx.set_arg3(shm_size as u64);
    });

    if let Some(server_group) = object_table::with_thread(server_thread, |t| t.cap_group) {
        object_table::with_cap_group_mut(server_group, |g| {
            g.vmspace.unmap_range(server_uaddr, shm_size)
        });
    }

    sched::sched_enqueue(server_thread);
}

/// Run one side's teardown of a `RecycleReady` connection.
///
/// Which side is determined by comparing the recycling process against
/// the connection's recorded `client_badge`. Only once both sides have
/// run does the object reach `DeinitReady` with no capabilities left,
/// at which point the ordinary reference-counted free reclaims it.
pub fn recycle_connection(group_ref: ObjectRef, conn_ref: ObjectRef, client_process_exited: bool) {
    let (state, client_badge) =
        match object_table::with_connection(conn_ref, |c| (c.state, c.client_badge)) {
            Some(v) => v,
            None => return,
        };
    assert!(
        state == ConnState::RecycleReady || state == ConnState::DeinitReady,
        "recycling a connection that was never stopped"
    );

    let group_badge = object_table::with_cap_group(group_ref, |g| g.badge);
    let is_client_side = group_badge == Some(client_badge);

    if is_client_side {
        if state != ConnState::RecycleReady {
            return;
        }
        let server_thread =
            object_table::with_connection(conn_ref, |c| c.server_handler_thread).unwrap_or(ObjectRef::NULL);
        if server_thread.is_valid() {
            // Closing from the client side also clears what the server
            // allocated for this client and this connection.
            recycle_server_shadow_thread(conn_ref, server_thread, client_process_exited);

            let server_group = object_table::with_thread(server_thread, |t| t.cap_group);
            let caps = object_table::with_connection(conn_ref, |c| {
                (c.conn_cap_in_server, c.shm.cap_in_server)
            });
            if let (Some(server_group), Some((conn_cap, shm_cap))) = (server_group, caps) {
                let _ = cap::cap_free(server_group, conn_cap);
                let _ = cap::cap_free(server_group, shm_cap);
            }
        }
        object_table::with_connection_mut(conn_ref, |c| c.state = ConnState::DeinitReady);
    } else {
        if state != ConnState::RecycleReady {
            return;
        }
        // We are the server side. A server only reaches this while
        // exiting, so its resources are already being reclaimed; just
        // detach and let the client-side step free the object. The
        // ownership lock is released because the client-side step will
        // need to acquire it again; the connection cannot be used any
        // more either way.
        object_table::with_connection_mut(conn_ref, |c| {
            c.server_handler_thread = ObjectRef::NULL;
            c.state = ConnState::DeinitReady;
            c.ownership.unlock();
        });
    }
}

/// Close a connection from the client side.
///
/// Invoked by a client thread while its process keeps running, so the
/// server's exit routine is entered *without* the destructor: server
/// state for the whole client process stays, only this connection's
/// state goes.
pub fn sys_ipc_close_connection(conn_cap: Cap) -> SysResult<()> {
    let group = sched::current_cap_group();
    let conn_ref = cap::lookup(group, conn_cap, ObjectType::Connection)?;

    stop_connection(conn_ref)?;
    recycle_connection(group, conn_ref, false);

    let (client_uaddr, shm_size, shm_cap) = object_table::with_connection(conn_ref, |c| {
        (c.shm.client_uaddr, c.shm.size, c.shm.cap_in_client)
    })
    .ok_or(SysError::InvalidCap)?;

    object_table::with_cap_group_mut(group, |g| g.vmspace.unmap_range(client_uaddr, shm_size));
    let _ = cap::cap_free(group, shm_cap);
    cap::cap_free(group, conn_cap)?;

    Ok(())
}

/// Stop the register threads of an exiting process.
///
/// The register lock is taken and deliberately never released: the
/// register thread must not execute again. A thread already marked
/// exited is skipped so a retried sweep does not deadlock on the lock it
/// took last time.
fn stop_ipc_registration(group_ref: ObjectRef) -> SysResult<()> {
    let threads =
        object_table::with_cap_group(group_ref, |g| g.threads.clone()).ok_or(SysError::InvalidCap)?;

    let mut ret = Ok(());
    for thread in threads {
        let eligible = object_table::with_thread(thread, |t| {
            t.ttype == ThreadType::Register && !t.is_exited()
        })
        .unwrap_or(false);
        if !eligible {
            continue;
        }

        let locked = object_table::with_thread(thread, |t| {
            t.ipc_config.register_cb().map(|c| c.register_lock.try_lock())
        })
        .flatten();
        match locked {
            Some(true) | None => sched::thread_set_exited(thread),
            // A registration is ongoing; try again next sweep.
            Some(false) => ret = Err(SysError::Retry),
        }
    }
    ret
}

/// Recycle everything a process holds: the per-process sweep.
///
/// Retried by the caller as long as it returns `Retry`; every step is
/// idempotent, so each retry only redoes the steps that could not
/// complete.
pub fn recycle_cap_group(group_ref: ObjectRef) -> SysResult<()> {
    let threads =
        object_table::with_cap_group(group_ref, |g| g.threads.clone()).ok_or(SysError::InvalidCap)?;

    // Phase 1: mark every thread as exiting, so in-flight IPC paths run
    // their exit shortcuts instead of completing normally.
    for thread in &threads {
        object_table::with_thread_mut(*thread, |t| {
            if t.exit_state == ExitState::Running {
                t.exit_state = ExitState::Exiting;
            }
        });
    }

    // Phase 2: stop registrations and connections. Any held lock turns
    // the whole sweep into a Retry.
    let mut ret = stop_ipc_registration(group_ref);

    let connections: Vec<ObjectRef> = object_table::with_cap_group(group_ref, |g| {
        g.table
            .iter_occupied()
            .filter(|(_, slot)| slot.obj_type() == ObjectType::Connection)
            .map(|(_, slot)| slot.object())
            .collect()
    })
    .ok_or(SysError::InvalidCap)?;

    for conn in &connections {
        if let Err(e) = stop_connection(*conn) {
            ret = Err(e);
        }
    }
    ret?;

    // Phase 3: all locks are held; dismantle the connections. The whole
    // process is exiting, so the server exit routines get the destructor.
    for conn in &connections {
        recycle_connection(group_ref, *conn, true);
    }

    for thread in &threads {
        sched::thread_set_exited(*thread);
    }

    // Phase 4: drop every capability the process holds. Objects whose
    // last capability lived here are reclaimed by the ordinary free.
    let caps: Vec<Cap> = object_table::with_cap_group(group_ref, |g| {
        g.table.iter_occupied().map(|(cap, _)| cap).collect()
    })
    .ok_or(SysError::InvalidCap)?;
    for cap in caps {
        let _ = cap::cap_free(group_ref, cap);
    }

    log::debug!("cap group {group_ref:?} recycled");
    Ok(())
}
