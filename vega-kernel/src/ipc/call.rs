//! IPC call/return fast path
//!
//! One synchronous request is two direct thread switches: `ipc_call`
//! moves control from the client into the server's handler thread, and
//! `ipc_return` moves it back with the reply value. The client's kernel
//! stack is reused as-is and nothing is queued.
//!
//! Every lock on this path is acquired with a non-blocking try; failure
//! surfaces as `Retry` to the caller. The classic deadlock of a chained
//! call (A calls B, B calls back into A's handler) cannot wedge the
//! kernel: the second acquisition simply fails and the caller retries.

use vega_cap::{Cap, ObjectRef, ObjectType};
use vega_syscall::MAX_CAP_TRANSFER;

use crate::cap::{self, object_table};
use crate::object::{ThreadState, ThreadType};
use crate::sched::{self, Switched};
use crate::syscall::error::{SysError, SysResult};

use super::cap_transfer;
use super::connection::ConnState;

/// Handle a failed try on a connection's ownership lock.
///
/// The lock is held either by another in-flight call or by the recycler.
/// If the calling thread itself is being torn down there is no point in
/// retrying:
///
/// - an ordinary thread is parked as exited here, and control goes to the
///   scheduler (the `Ok` value proves the caller no longer runs);
/// - a shadow thread is mid-chain (it is B in A→B→C) and must get an
///   error back so it can still `ipc_return` to its own client and
///   release the locks it holds.
///
/// Otherwise the caller gets `Retry` and re-issues the syscall.
pub(crate) fn check_if_exiting() -> Result<Switched, SysError> {
    let caller = sched::current_thread();
    match object_table::with_thread(caller, |t| (t.is_exiting(), t.ttype)) {
        Some((true, ThreadType::Shadow)) => {
            // B may never return the control flow to A; if so, A hangs
            // until the recycler intervenes. A timeout mechanism would be
            // required to cover that case.
            Err(SysError::ConnectionClosing)
        }
        Some((true, _)) => {
            sched::thread_set_exited(caller);
            Ok(sched::reschedule())
        }
        _ => Err(SysError::Retry),
    }
}

/// Issue an IPC call on a connection.
///
/// On success control transfers directly into the handler thread, which
/// starts at its recorded entry with the call arguments (server-side shm
/// address, shm size, transferred-capability count, client badge) in its
/// argument registers, running on the calling thread's scheduling
/// context. The reply arrives in the caller's return register when the
/// handler invokes [`sys_ipc_return`].
pub fn sys_ipc_call(conn_cap: Cap, cap_num: usize) -> Result<Switched, SysError> {
    if cap_num > MAX_CAP_TRANSFER {
        return Err(SysError::InvalidArg);
    }

    let caller = sched::current_thread();
    let group = sched::current_cap_group();
    let conn_ref = cap::lookup(group, conn_cap, ObjectType::Connection)?;

    enum Gate {
        Proceed(ObjectRef),
        WrongState,
        Busy,
    }

    // No modifications happen before the ownership lock is taken, so a
    // contended caller can simply try again later.
    let gate = object_table::with_connection(conn_ref, |c| {
        if c.ownership.try_lock() {
            if c.state != ConnState::Valid {
                c.ownership.unlock();
                Gate::WrongState
            } else {
                Gate::Proceed(c.server_handler_thread)
            }
        } else {
            Gate::Busy
        }
    })
    .ok_or(SysError::InvalidCap)?;

    let handler = match gate {
        Gate::Proceed(h) => h,
        // The connection is being torn down.
        Gate::WrongState => return Err(SysError::InvalidArg),
        Gate::Busy => return check_if_exiting(),
    };

    // The handler may serve other connections: taking its IPC lock keeps
    // both the thread and this connection to one call at a time.
    let locked = object_table::with_thread(handler, |t| {
        t.ipc_config.handler().map(|h| h.ipc_lock.try_lock())
    });
    let locked = match locked {
        Some(Some(l)) => l,
        _ => panic!("valid connection without a configured handler thread"),
    };
    if !locked {
        object_table::with_connection(conn_ref, |c| c.ownership.unlock());
        return Err(SysError::Retry);
    }

    // Stale capabilities from the previous cycle must never be visible.
    let (server_uaddr, shm_size, badge) = object_table::with_connection_mut(conn_ref, |c| {
        c.invalidate_server_buf();
        c.current_client_thread = caller;
        (c.shm.server_uaddr, c.shm.size, c.client_badge)
    })
    .ok_or(SysError::InvalidCap)?;

    sched::thread_set_ts_blocking(caller);
    let donated = object_table::with_thread(caller, |t| t.sc).ok_or(SysError::InvalidCap)?;

    object_table::with_thread_mut(handler, |t| {
        let (entry, stack) = match t.ipc_config.handler() {
            Some(h) => (h.entry, h.stack),
            None => unreachable!("handler config checked above"),
        };
        if let Some(h) = t.ipc_config.handler_mut() {
            h.active_conn = conn_ref;
        }
        // The handler executes with the client's priority budget.
        t.sc = donated;
        t.ctx.set_stack(stack);
        t.ctx.set_next_ip(entry);
        t.ctx.set_arg0(server_uaddr.as_u64());
        t.ctx.set_arg1(shm_size as u64);
        t.ctx.set_arg2(cap_num as u64);
        t.ctx.set_arg3(badge.value());
    });

    log::trace!("ipc_call: {caller:?} -> handler {handler:?} on {conn_ref:?}");
    Ok(sched::sched_to_thread(handler))
}

/// Return from a handler thread to the client that called it.
///
/// Two independent exit-race checks guarantee the client never hangs:
/// a dying handler still delivers (an error) to the client, and a dead
/// client is never switched into.
pub fn sys_ipc_return(ret: u64, cap_num: usize) -> Result<Switched, SysError> {
    let handler = sched::current_thread();
    let conn_ref = object_table::with_thread(handler, |t| {
        t.ipc_config.handler().map(|h| h.active_conn)
    })
    .ok_or(SysError::InvalidArg)?
    .ok_or(SysError::InvalidArg)?;
    if conn_ref.is_null() {
        return Err(SysError::InvalidArg);
    }

    let mut ret = ret;

    // Step 1: the handler thread itself is mid-exit. Stop the connection
    // and force an error reply; the client must still receive one.
    if sched::thread_is_exiting(handler) {
        log::debug!("ipc_return: handler {handler:?} exiting");
        object_table::with_connection_mut(conn_ref, |c| c.state = ConnState::IncomeStopped);
        sched::thread_set_exited(handler);
        ret = SysError::ConnectionClosing.as_i64() as u64;
    }

    let client = object_table::with_connection(conn_ref, |c| c.current_client_thread)
        .ok_or(SysError::InvalidArg)?;

    // Step 2: the client is mid-exit. The connection belongs to the
    // client process, so it is useless now.
    if sched::thread_is_exiting(client) {
        log::debug!("ipc_return: client {client:?} exiting");
        object_table::with_connection_mut(conn_ref, |c| c.state = ConnState::IncomeStopped);

        let client_is_shadow =
            object_table::with_thread(client, |t| t.ttype == ThreadType::Shadow).unwrap_or(false);
        if !client_is_shadow {
            // Do not switch into a dead thread: release everything, mark
            // the client exited and let the scheduler pick someone else.
            object_table::with_thread_mut(handler, |t| {
                if let Some(h) = t.ipc_config.handler_mut() {
                    h.active_conn = ObjectRef::NULL;
                }
                t.state = ThreadState::Waiting;
                t.sc = None;
            });
            object_table::with_thread(handler, |t| {
                if let Some(h) = t.ipc_config.handler() {
                    h.ipc_lock.unlock();
                }
            });
            object_table::with_connection(conn_ref, |c| c.ownership.unlock());
            sched::thread_set_exited(client);
            return Ok(sched::reschedule());
        }
        // The client is B in a chained call (A:B:C) and we are C: return
        // to B anyway so it can unwind to A and release its own locks.
    }

    // Reply-side capability transfer, eager for all staged slots.
    if cap_num != 0 {
        object_table::with_connection_mut(conn_ref, |c| c.invalidate_client_buf());
        cap_transfer::transfer_to_client(conn_ref, handler, 0, cap_num)?;
    }

    // The handler becomes passive again. The donated scheduling context
    // must be detached *before* the IPC lock is released: once the lock
    // is free a new client may attach its own context to this thread.
    object_table::with_thread_mut(handler, |t| {
        if let Some(h) = t.ipc_config.handler_mut() {
            h.active_conn = ObjectRef::NULL;
        }
        t.state = ThreadState::Waiting;
        t.sc = None;
    });
    object_table::with_thread(handler, |t| {
        if let Some(h) = t.ipc_config.handler() {
            h.ipc_lock.unlock();
        }
    });
    object_table::with_connection(conn_ref, |c| c.ownership.unlock());

    object_table::with_thread_mut(client, |t| t.ctx.set_return(ret));
    log::trace!("ipc_return: handler {handler:?} -> client {client:?}");
    Ok(sched::sched_to_thread(client))
}

/// Return from a handler thread's forced exit routine.
///
/// The recycler entered this thread at its exit routine with a fresh
/// scheduling context and the handler's IPC lock held (see
/// [`crate::recycle`]); this syscall parks the thread and releases the
/// lock so remaining connections on the same handler can proceed.
pub fn sys_ipc_exit_routine_return() -> Switched {
    let caller = sched::current_thread();
    let has_config =
        object_table::with_thread(caller, |t| t.ipc_config.handler().is_some()).unwrap_or(false);
    if has_config {
        sched::thread_set_ts_waiting(caller);
        object_table::with_thread_mut(caller, |t| t.sc = None);
        object_table::with_thread(caller, |t| {
            if let Some(h) = t.ipc_config.handler() {
                h.ipc_lock.unlock();
            }
        });
    }
    sched::reschedule()
}

/// Try to take a connection's ownership for a client-side transfer
/// syscall, with the same contention handling as `sys_ipc_call`.
///
/// `Ok(None)` means the lock is held and the connection is `Valid`;
/// `Ok(Some(_))` means the calling thread was parked as exited.
pub(crate) fn lock_client_connection(conn_ref: ObjectRef) -> SysResult<Option<Switched>> {
    enum Gate {
        Locked,
        WrongState,
        Busy,
    }

    let gate = object_table::with_connection(conn_ref, |c| {
        if c.ownership.try_lock() {
            if c.state != ConnState::Valid {
                c.ownership.unlock();
                Gate::WrongState
            } else {
                Gate::Locked
            }
        } else {
            Gate::Busy
        }
    })
    .ok_or(SysError::InvalidCap)?;

    match gate {
        Gate::Locked => Ok(None),
        Gate::WrongState => Err(SysError::InvalidArg),
        Gate::Busy => check_if_exiting().map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vega_common::VirtAddr;

    use crate::object::ExitState;
    use crate::test_support::{
        self, kernel_lock, register_connection, run_as, setup_client, setup_service, spawn_thread,
    };

    struct CallSetup {
        service: test_support::Service,
        client: test_support::Client,
        conn_cap: vega_cap::Cap,
        conn_ref: ObjectRef,
    }

    fn setup_call(badge: u64, pid: i32) -> CallSetup {
        let service = setup_service(badge, pid);
        let client = setup_client(badge + 1, pid + 1, 0x1000);
        let conn_cap = register_connection(&service, &client, 0x5000_0000, 0x6000_0000);
        let conn_ref = cap::lookup(client.group, conn_cap, ObjectType::Connection).unwrap();
        CallSetup {
            service,
            client,
            conn_cap,
            conn_ref,
        }
    }

    #[test]
    fn test_call_return_roundtrip() {
        let _guard = kernel_lock();
        let s = setup_call(0x201, 20);

        let client_sc = object_table::with_thread(s.client.thread, |t| t.sc).unwrap();
        run_as(s.client.thread);
        let switched = sys_ipc_call(s.conn_cap, 0).unwrap();
        drop(switched);

        // The handler runs at its recorded entry with the call arguments
        // and the client's donated scheduling context.
        assert_eq!(sched::current_thread(), s.service.handler_thread);
        object_table::with_thread(s.service.handler_thread, |t| {
            assert_eq!(t.ctx.next_ip(), VirtAddr::new(test_support::HANDLER_ENTRY));
            assert_eq!(t.ctx.arg(0), 0x6000_0000);
            assert_eq!(t.ctx.arg(1), 0x1000);
            assert_eq!(t.ctx.arg(2), 0);
            assert_eq!(t.ctx.arg(3), 0x202);
            assert_eq!(t.sc, client_sc);
            assert_eq!(t.ipc_config.handler().unwrap().active_conn, s.conn_ref);
        })
        .unwrap();
        object_table::with_thread(s.client.thread, |t| {
            assert_eq!(t.state, ThreadState::Blocking);
        })
        .unwrap();
        object_table::with_connection(s.conn_ref, |c| {
            assert!(c.ownership.is_locked());
            assert_eq!(c.current_client_thread, s.client.thread);
        })
        .unwrap();

        // Reply: the client gets 42 and both locks are released.
        let switched = sys_ipc_return(42, 0).unwrap();
        drop(switched);
        assert_eq!(sched::current_thread(), s.client.thread);
        assert_eq!(
            object_table::with_thread(s.client.thread, |t| t.ctx.return_value()),
            Some(42)
        );
        object_table::with_thread(s.service.handler_thread, |t| {
            assert_eq!(t.state, ThreadState::Waiting);
            assert!(t.sc.is_none());
            assert!(t.ipc_config.handler().unwrap().active_conn.is_null());
            assert!(!t.ipc_config.handler().unwrap().ipc_lock.is_locked());
        })
        .unwrap();
        object_table::with_connection(s.conn_ref, |c| {
            assert!(!c.ownership.is_locked());
        })
        .unwrap();
    }

    #[test]
    fn test_call_argument_validation() {
        let _guard = kernel_lock();
        let s = setup_call(0x211, 30);

        run_as(s.client.thread);
        assert!(matches!(
            sys_ipc_call(s.conn_cap, MAX_CAP_TRANSFER + 1),
            Err(SysError::InvalidArg)
        ));
        assert!(matches!(
            sys_ipc_call(Cap::from_raw(200), 0),
            Err(SysError::InvalidCap)
        ));
    }

    #[test]
    fn test_second_caller_observes_retry() {
        let _guard = kernel_lock();
        let s = setup_call(0x221, 40);

        run_as(s.client.thread);
        let switched = sys_ipc_call(s.conn_cap, 0).unwrap();
        drop(switched);

        // Another thread of the client process tries the same connection
        // while the call is in flight: it must not block.
        let (second, _) = spawn_thread(
            s.client.group,
            crate::object::ThreadType::User,
            0x0050_0000,
            test_support::STACK_TOP + 0x4000,
        );
        run_as(second);
        assert!(matches!(
            sys_ipc_call(s.conn_cap, 0),
            Err(SysError::Retry)
        ));

        // Finish the outstanding call; the second caller now succeeds.
        run_as(s.service.handler_thread);
        let switched = sys_ipc_return(0, 0).unwrap();
        drop(switched);
        run_as(second);
        let switched = sys_ipc_call(s.conn_cap, 0).unwrap();
        drop(switched);
        assert_eq!(sched::current_thread(), s.service.handler_thread);
    }

    #[test]
    fn test_handler_contention_across_connections() {
        let _guard = kernel_lock();
        let s = setup_call(0x231, 50);

        // A second client with its own connection to the same handler.
        let client2 = setup_client(0x233, 52, 0x1000);
        let conn2_cap = register_connection(&s.service, &client2, 0x5000_0000, 0x6100_0000);
        let conn2_ref = cap::lookup(client2.group, conn2_cap, ObjectType::Connection).unwrap();

        run_as(s.client.thread);
        let switched = sys_ipc_call(s.conn_cap, 0).unwrap();
        drop(switched);

        // The handler's IPC lock is held by the first call: the second
        // connection observes Retry and its own ownership is released.
        run_as(client2.thread);
        assert!(matches!(sys_ipc_call(conn2_cap, 0), Err(SysError::Retry)));
        object_table::with_connection(conn2_ref, |c| {
            assert!(!c.ownership.is_locked());
        })
        .unwrap();
    }

    #[test]
    fn test_return_when_client_exiting() {
        let _guard = kernel_lock();
        let s = setup_call(0x241, 60);

        run_as(s.client.thread);
        let switched = sys_ipc_call(s.conn_cap, 0).unwrap();
        drop(switched);

        // The client process is killed while its call is in the handler.
        object_table::with_thread_mut(s.client.thread, |t| {
            t.exit_state = ExitState::Exiting;
        })
        .unwrap();

        let switched = sys_ipc_return(42, 0).unwrap();
        drop(switched);

        // No switch into a dead thread: the handler gave up the CPU.
        assert!(sched::current_thread().is_null());
        assert!(
            object_table::with_thread(s.client.thread, |t| t.is_exited()).unwrap()
        );
        object_table::with_connection(s.conn_ref, |c| {
            assert_eq!(c.state, ConnState::IncomeStopped);
            assert!(!c.ownership.is_locked());
        })
        .unwrap();
        object_table::with_thread(s.service.handler_thread, |t| {
            assert_eq!(t.state, ThreadState::Waiting);
            assert!(t.sc.is_none());
            assert!(!t.ipc_config.handler().unwrap().ipc_lock.is_locked());
        })
        .unwrap();
    }

    #[test]
    fn test_return_when_handler_exiting() {
        let _guard = kernel_lock();
        let s = setup_call(0x251, 70);

        run_as(s.client.thread);
        let switched = sys_ipc_call(s.conn_cap, 0).unwrap();
        drop(switched);

        object_table::with_thread_mut(s.service.handler_thread, |t| {
            t.exit_state = ExitState::Exiting;
        })
        .unwrap();

        // The client still receives a reply, forced to an error.
        let switched = sys_ipc_return(42, 0).unwrap();
        drop(switched);
        assert_eq!(sched::current_thread(), s.client.thread);
        assert_eq!(
            object_table::with_thread(s.client.thread, |t| t.ctx.return_value()),
            Some(SysError::ConnectionClosing.as_i64() as u64)
        );
        object_table::with_connection(s.conn_ref, |c| {
            assert_eq!(c.state, ConnState::IncomeStopped);
        })
        .unwrap();
        assert!(
            object_table::with_thread(s.service.handler_thread, |t| t.is_exited()).unwrap()
        );
    }

    #[test]
    fn test_call_on_stopped_connection_fails() {
        let _guard = kernel_lock();
        let s = setup_call(0x261, 80);

        object_table::with_connection_mut(s.conn_ref, |c| {
            c.state = ConnState::IncomeStopped;
        })
        .unwrap();
        run_as(s.client.thread);
        assert!(matches!(
            sys_ipc_call(s.conn_cap, 0),
            Err(SysError::InvalidArg)
        ));
        // The gate released the lock it briefly took.
        object_table::with_connection(s.conn_ref, |c| {
            assert!(!c.ownership.is_locked());
        })
        .unwrap();
    }

    #[test]
    fn test_exiting_shadow_caller_gets_closing() {
        let _guard = kernel_lock();
        let s = setup_call(0x271, 90);

        // Hold the ownership lock so the caller hits the contention path.
        object_table::with_connection(s.conn_ref, |c| {
            assert!(c.ownership.try_lock());
        })
        .unwrap();

        let conn_in_shadow = test_support::grant(
            s.client.group,
            s.service.server_group,
            s.conn_cap,
        );
        object_table::with_thread_mut(s.service.handler_thread, |t| {
            t.exit_state = ExitState::Exiting;
        })
        .unwrap();
        run_as(s.service.handler_thread);
        assert!(matches!(
            sys_ipc_call(conn_in_shadow, 0),
            Err(SysError::ConnectionClosing)
        ));

        object_table::with_connection(s.conn_ref, |c| c.ownership.unlock()).unwrap();
    }
}
