//! Capability transfer during IPC calls
//!
//! A call declares up front how many capabilities it carries (`cap_num`),
//! but the actual copies are made per slot:
//!
//! - the sender stages `{cap, mask, rest}` into its side's buffer with
//!   `ipc_set_cap`;
//! - a server reads client capabilities lazily: the first `ipc_get_cap`
//!   on an index performs the copy into the server's table and caches the
//!   result, so a call that never touches a slot never pays for it;
//! - reply capabilities staged by the server are copied eagerly by
//!   `ipc_return`, and the client's `ipc_get_cap` just reads them.
//!
//! Both buffers are re-invalidated at the start of each call cycle, so a
//! `valid` slot always names a copy made in the current cycle.

use alloc::vec::Vec;

use vega_cap::{Cap, CapRights, ObjectRef, ObjectType};
use vega_syscall::MAX_CAP_TRANSFER;

use crate::cap::{self, object_table};
use crate::sched;
use crate::syscall::error::{SysError, SysResult};
use crate::syscall::Outcome;

use super::call;
use super::connection::CapTransferSlot;

/// The connection argument of the transfer syscalls: either a client's
/// connection capability or the server sentinel, which resolves through
/// the calling handler thread's active call.
#[derive(Clone, Copy, Debug)]
pub enum CapSelector {
    /// The handler thread's active connection.
    Server,
    /// A connection named in the caller's capability table.
    Conn(Cap),
}

/// Which buffer feeds which process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    /// Copy slots staged by the client into the server's table.
    ClientToServer,
    /// Copy slots staged by the server into the client's table.
    ServerToClient,
}

/// Copy `cap_num` staged slots starting at `start_idx`.
///
/// Writes the receiving side's buffer slots as `valid` with the new
/// handles. A copy that fails mid-way frees the handles it already
/// created and leaves the destination slots invalid.
fn send_caps(
    src_group: ObjectRef,
    dst_group: ObjectRef,
    conn_ref: ObjectRef,
    direction: Direction,
    start_idx: usize,
    cap_num: usize,
) -> SysResult<()> {
    let end = start_idx.checked_add(cap_num).ok_or(SysError::OutOfRange)?;
    if end > MAX_CAP_TRANSFER {
        return Err(SysError::OutOfRange);
    }

    let staged: Vec<CapTransferSlot> = object_table::with_connection(conn_ref, |c| {
        let buf = match direction {
            Direction::ClientToServer => &c.client_cap_buf,
            Direction::ServerToClient => &c.server_cap_buf,
        };
        buf[start_idx..end].to_vec()
    })
    .ok_or(SysError::InvalidCap)?;

    let mut copied: Vec<Cap> = Vec::with_capacity(cap_num);
    for slot in &staged {
        match cap::cap_copy(src_group, dst_group, slot.cap, slot.mask, slot.rest) {
            Ok(new_cap) => copied.push(new_cap),
            Err(e) => {
                for cap in copied {
                    let _ = cap::cap_free(dst_group, cap);
                }
                return Err(e);
            }
        }
    }

    object_table::with_connection_mut(conn_ref, |c| {
        let buf = match direction {
            Direction::ClientToServer => &mut c.server_cap_buf,
            Direction::ServerToClient => &mut c.client_cap_buf,
        };
        for (i, new_cap) in copied.iter().enumerate() {
            buf[start_idx + i] = CapTransferSlot {
                valid: true,
                cap: *new_cap,
                mask: CapRights::NONE,
                rest: CapRights::NONE,
            };
        }
    })
    .ok_or(SysError::InvalidCap)?;

    Ok(())
}

/// Copy the server's staged reply slots into the client's table.
///
/// Called by `ipc_return` with the handler's IPC lock and the
/// connection's ownership still held.
pub(crate) fn transfer_to_client(
    conn_ref: ObjectRef,
    handler: ObjectRef,
    start_idx: usize,
    cap_num: usize,
) -> SysResult<()> {
    let server_group =
        object_table::with_thread(handler, |t| t.cap_group).ok_or(SysError::InvalidCap)?;
    let client = object_table::with_connection(conn_ref, |c| c.current_client_thread)
        .ok_or(SysError::InvalidCap)?;
    let client_group =
        object_table::with_thread(client, |t| t.cap_group).ok_or(SysError::InvalidCap)?;
    send_caps(
        server_group,
        client_group,
        conn_ref,
        Direction::ServerToClient,
        start_idx,
        cap_num,
    )
}

/// Resolve the active connection of the calling handler thread.
fn active_conn_of_caller() -> SysResult<ObjectRef> {
    let caller = sched::current_thread();
    let conn_ref = object_table::with_thread(caller, |t| {
        t.ipc_config.handler().map(|h| h.active_conn)
    })
    .ok_or(SysError::InvalidCap)?
    .ok_or(SysError::InvalidCap)?;
    if conn_ref.is_null() {
        return Err(SysError::InvalidCap);
    }
    Ok(conn_ref)
}

/// Fetch a transferred capability.
///
/// Server side: performs the client→server copy lazily on first access
/// and returns the cached server-side handle on repeats. Client side:
/// returns the handle `ipc_return` copied back, `InvalidCap` if the slot
/// was never filled in this cycle.
pub fn sys_ipc_get_cap(selector: CapSelector, index: usize) -> SysResult<Outcome> {
    if index >= MAX_CAP_TRANSFER {
        return Err(SysError::OutOfRange);
    }

    match selector {
        CapSelector::Server => {
            let conn_ref = active_conn_of_caller()?;
            let cached = object_table::with_connection(conn_ref, |c| c.server_cap_buf[index])
                .ok_or(SysError::InvalidCap)?;
            if cached.valid {
                return Ok(Outcome::Return(cached.cap.raw() as i64));
            }

            let client = object_table::with_connection(conn_ref, |c| c.current_client_thread)
                .ok_or(SysError::InvalidCap)?;
            let client_group = object_table::with_thread(client, |t| t.cap_group)
                .ok_or(SysError::InvalidCap)?;
            let server_group = sched::current_cap_group();
            send_caps(
                client_group,
                server_group,
                conn_ref,
                Direction::ClientToServer,
                index,
                1,
            )
            .map_err(|_| SysError::InvalidCap)?;

            let cap = object_table::with_connection(conn_ref, |c| c.server_cap_buf[index].cap)
                .ok_or(SysError::InvalidCap)?;
            Ok(Outcome::Return(cap.raw() as i64))
        }

        CapSelector::Conn(conn_cap) => {
            let group = sched::current_cap_group();
            let conn_ref = cap::lookup(group, conn_cap, ObjectType::Connection)?;
            if let Some(switched) = call::lock_client_connection(conn_ref)? {
                return Ok(Outcome::Switched(switched));
            }

            let slot = object_table::with_connection(conn_ref, |c| c.client_cap_buf[index]);
            object_table::with_connection(conn_ref, |c| c.ownership.unlock());

            match slot {
                // Reply capabilities were already copied in ipc_return.
                Some(s) if s.valid => Ok(Outcome::Return(s.cap.raw() as i64)),
                Some(_) => Err(SysError::InvalidCap),
                None => Err(SysError::InvalidCap),
            }
        }
    }
}

/// Stage a capability for transfer.
///
/// The two masks describe how the copy's rights are derived from the
/// source capability; see [`CapRights::attenuate`].
pub fn sys_ipc_set_cap(
    selector: CapSelector,
    index: usize,
    cap: Cap,
    mask: CapRights,
    rest: CapRights,
) -> SysResult<Outcome> {
    if index >= MAX_CAP_TRANSFER {
        return Err(SysError::OutOfRange);
    }

    match selector {
        CapSelector::Server => {
            let conn_ref = active_conn_of_caller()?;
            object_table::with_connection_mut(conn_ref, |c| {
                let slot = &mut c.server_cap_buf[index];
                slot.cap = cap;
                slot.mask = mask;
                slot.rest = rest;
            })
            .ok_or(SysError::InvalidCap)?;
            Ok(Outcome::Return(0))
        }

        CapSelector::Conn(conn_cap) => {
            let group = sched::current_cap_group();
            let conn_ref = cap::lookup(group, conn_cap, ObjectType::Connection)?;
            if let Some(switched) = call::lock_client_connection(conn_ref)? {
                return Ok(Outcome::Switched(switched));
            }

            object_table::with_connection_mut(conn_ref, |c| {
                let slot = &mut c.client_cap_buf[index];
                slot.cap = cap;
                slot.mask = mask;
                slot.rest = rest;
                c.ownership.unlock();
            });
            Ok(Outcome::Return(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::ipc::call::{sys_ipc_call, sys_ipc_return};
    use crate::test_support::{
        kernel_lock, make_shm, register_connection, run_as, setup_client, setup_service,
    };

    fn return_value(outcome: Outcome) -> i64 {
        match outcome {
            Outcome::Return(v) => v,
            Outcome::Switched(_) => panic!("unexpected control transfer"),
        }
    }

    fn server_table_occupancy(group: ObjectRef) -> usize {
        object_table::with_cap_group(group, |g| g.table.occupied()).unwrap()
    }

    #[test]
    fn test_lazy_copy_to_server_is_memoised() {
        let _guard = kernel_lock();
        let service = setup_service(0x301, 100);
        let client = setup_client(0x302, 101, 0x1000);
        let conn_cap = register_connection(&service, &client, 0x5000_0000, 0x6000_0000);

        // The client stages an extra shm capability in slot 0.
        let payload = make_shm(client.group, 0x2000);
        run_as(client.thread);
        let outcome = sys_ipc_set_cap(
            CapSelector::Conn(conn_cap),
            0,
            payload,
            CapRights::ALL,
            CapRights::NONE,
        )
        .unwrap();
        assert_eq!(return_value(outcome), 0);

        let switched = sys_ipc_call(conn_cap, 1).unwrap();
        drop(switched);

        // First access copies; the handle lands in the server's table.
        let before = server_table_occupancy(service.server_group);
        let first = return_value(sys_ipc_get_cap(CapSelector::Server, 0).unwrap());
        assert_eq!(server_table_occupancy(service.server_group), before + 1);

        // Repeated access returns the cached handle without copying again.
        let second = return_value(sys_ipc_get_cap(CapSelector::Server, 0).unwrap());
        assert_eq!(first, second);
        assert_eq!(server_table_occupancy(service.server_group), before + 1);

        // The copy names the same object the client staged.
        let client_obj = cap::lookup(client.group, payload, ObjectType::SharedMemory).unwrap();
        let server_obj = cap::lookup(
            service.server_group,
            Cap::from_raw(first as u32),
            ObjectType::SharedMemory,
        )
        .unwrap();
        assert_eq!(client_obj, server_obj);

        let switched = sys_ipc_return(0, 0).unwrap();
        drop(switched);
    }

    #[test]
    fn test_reply_caps_are_copied_on_return() {
        let _guard = kernel_lock();
        let service = setup_service(0x311, 110);
        let client = setup_client(0x312, 111, 0x1000);
        let conn_cap = register_connection(&service, &client, 0x5000_0000, 0x6000_0000);

        run_as(client.thread);
        let switched = sys_ipc_call(conn_cap, 0).unwrap();
        drop(switched);

        // The server stages one of its own capabilities as the reply.
        let reply_payload = make_shm(service.server_group, 0x3000);
        let outcome = sys_ipc_set_cap(
            CapSelector::Server,
            0,
            reply_payload,
            CapRights::ALL,
            CapRights::NONE,
        )
        .unwrap();
        assert_eq!(return_value(outcome), 0);

        let switched = sys_ipc_return(0, 1).unwrap();
        drop(switched);

        // The client reads the copied handle; it names the same object.
        let got = return_value(sys_ipc_get_cap(CapSelector::Conn(conn_cap), 0).unwrap());
        let client_obj = cap::lookup(
            client.group,
            Cap::from_raw(got as u32),
            ObjectType::SharedMemory,
        )
        .unwrap();
        let server_obj =
            cap::lookup(service.server_group, reply_payload, ObjectType::SharedMemory).unwrap();
        assert_eq!(client_obj, server_obj);
    }

    #[test]
    fn test_index_bounds() {
        let _guard = kernel_lock();
        let service = setup_service(0x321, 120);
        let client = setup_client(0x322, 121, 0x1000);
        let conn_cap = register_connection(&service, &client, 0x5000_0000, 0x6000_0000);

        run_as(client.thread);
        assert!(matches!(
            sys_ipc_get_cap(CapSelector::Conn(conn_cap), MAX_CAP_TRANSFER),
            Err(SysError::OutOfRange)
        ));
        assert!(matches!(
            sys_ipc_set_cap(
                CapSelector::Conn(conn_cap),
                MAX_CAP_TRANSFER,
                conn_cap,
                CapRights::ALL,
                CapRights::NONE,
            ),
            Err(SysError::OutOfRange)
        ));
    }

    #[test]
    fn test_unfilled_client_slot_is_invalid() {
        let _guard = kernel_lock();
        let service = setup_service(0x331, 130);
        let client = setup_client(0x332, 131, 0x1000);
        let conn_cap = register_connection(&service, &client, 0x5000_0000, 0x6000_0000);

        run_as(client.thread);
        let switched = sys_ipc_call(conn_cap, 0).unwrap();
        drop(switched);
        let switched = sys_ipc_return(0, 0).unwrap();
        drop(switched);

        // No reply capability was transferred in this cycle.
        assert!(matches!(
            sys_ipc_get_cap(CapSelector::Conn(conn_cap), 0),
            Err(SysError::InvalidCap)
        ));
    }

    #[test]
    fn test_buffers_do_not_leak_across_cycles() {
        let _guard = kernel_lock();
        let service = setup_service(0x341, 140);
        let client = setup_client(0x342, 141, 0x1000);
        let conn_cap = register_connection(&service, &client, 0x5000_0000, 0x6000_0000);

        let payload = make_shm(client.group, 0x2000);
        run_as(client.thread);
        let _ = sys_ipc_set_cap(
            CapSelector::Conn(conn_cap),
            0,
            payload,
            CapRights::ALL,
            CapRights::NONE,
        )
        .unwrap();

        // Cycle 1: the server reads the slot, caching a copy.
        let switched = sys_ipc_call(conn_cap, 1).unwrap();
        drop(switched);
        let first = return_value(sys_ipc_get_cap(CapSelector::Server, 0).unwrap());
        let switched = sys_ipc_return(0, 0).unwrap();
        drop(switched);

        // Cycle 2: the cache from cycle 1 must not be visible; a fresh
        // read performs a fresh copy.
        let switched = sys_ipc_call(conn_cap, 1).unwrap();
        drop(switched);
        let cached = object_table::with_connection(
            cap::lookup(client.group, conn_cap, ObjectType::Connection).unwrap(),
            |c| c.server_cap_buf[0].valid,
        )
        .unwrap();
        assert!(!cached);
        let second = return_value(sys_ipc_get_cap(CapSelector::Server, 0).unwrap());
        assert_ne!(first, second);
        let switched = sys_ipc_return(0, 0).unwrap();
        drop(switched);
    }
}
