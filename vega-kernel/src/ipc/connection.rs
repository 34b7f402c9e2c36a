//! IPC connection objects
//!
//! A connection binds one client process to one server handler thread for
//! synchronous IPC. The connection capability lives in the client's table,
//! so every thread of the client process may use it; it is served by
//! exactly one handler thread, while one handler thread may serve many
//! connections.
//!
//! One shared-memory object is bound to each connection; client and
//! server may map it at different addresses. A connection serves one call
//! at a time, enforced by its `ownership` lock.
//!
//! The connection also carries its own teardown state machine
//! ([`ConnState`]) on top of the capability system's reference counting,
//! because a connection is *asymmetrically* shared: the client side and
//! the server side have independent teardown obligations, and the object
//! may only be freed once both sides have completed theirs. See
//! [`crate::recycle`].

use vega_cap::{Badge, Cap, CapRights, ObjectRef};
use vega_common::VirtAddr;
use vega_syscall::MAX_CAP_TRANSFER;

use crate::sync::IpcLock;

/// Connection lifecycle states.
///
/// An IPC call is declined unless the state is `Valid`, and a connection
/// is only safe to dismantle once it has reached `RecycleReady`. The
/// states only ever advance in the order listed; see
/// [`crate::recycle::stop_connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Fully established; calls may proceed.
    Valid = 0,
    /// New calls are declined. This is also the initial state: a
    /// connection under construction is not yet callable.
    IncomeStopped = 1,
    /// Both the ownership and the handler thread's IPC lock are held by
    /// the recycler; the connection can be dismantled.
    RecycleReady = 2,
    /// Both sides have finished their teardown steps; the capability
    /// system's ordinary reference-counted free may reclaim the object.
    DeinitReady = 3,
}

/// One slot of a capability-transfer buffer.
///
/// The sender stages `{cap, mask, rest}`; `valid` is set only once the
/// slot has been copied into the receiving process's table during the
/// current call cycle, and names the receiver-side handle from then on.
#[derive(Clone, Copy, Debug)]
pub struct CapTransferSlot {
    /// Whether `cap` names a completed copy in this call cycle.
    pub valid: bool,
    /// Staged sender-side handle, or the copied receiver-side handle
    /// once `valid`.
    pub cap: Cap,
    /// Rights mask applied during the copy.
    pub mask: CapRights,
    /// Rights the copy keeps unconditionally.
    pub rest: CapRights,
}

impl CapTransferSlot {
    /// An invalidated slot.
    pub const INVALID: Self = Self {
        valid: false,
        cap: Cap::from_raw(0),
        mask: CapRights::NONE,
        rest: CapRights::NONE,
    };
}

/// The shared-memory region bound to a connection.
///
/// Client and server map the same object at addresses of their own
/// choosing; both capability handles are kept for teardown.
#[derive(Clone, Copy, Debug)]
pub struct ShmDescriptor {
    /// Base address in the client's address space.
    pub client_uaddr: VirtAddr,
    /// Base address in the server's address space; filled in when the
    /// server completes the registration.
    pub server_uaddr: VirtAddr,
    /// Size of the region in bytes.
    pub size: usize,
    /// Client-side capability handle.
    pub cap_in_client: Cap,
    /// Server-side capability handle.
    pub cap_in_server: Cap,
}

/// IPC connection object.
pub struct Connection {
    /// Teardown state machine.
    pub state: ConnState,

    /// Serialises call attempts: at most one in-flight call. Locked by
    /// the client in `ipc_call`, released by the handler in `ipc_return`.
    pub ownership: IpcLock,

    /// Identity of the client process, fixed at creation. The server
    /// receives it on every call and the recycler uses it to tell which
    /// side of the connection it is dismantling.
    pub client_badge: Badge,

    /// Client process id, recorded alongside the badge.
    pub client_pid: i32,

    /// The client thread whose call is currently in flight. Any thread
    /// of the client process may use the connection, so this is recorded
    /// per call; it is a relation, not ownership.
    pub current_client_thread: ObjectRef,

    /// The handler thread serving this connection. Fixed once the
    /// registration completes; cleared by server-side recycling.
    pub server_handler_thread: ObjectRef,

    /// The bound shared-memory region.
    pub shm: ShmDescriptor,

    /// The connection's own handle in the client table, kept for teardown.
    pub conn_cap_in_client: Cap,
    /// The connection's own handle in the server table, kept for teardown.
    pub conn_cap_in_server: Cap,

    /// Server-side transfer buffer: staged server→client slots, and the
    /// server-side cache of client→server copies.
    pub server_cap_buf: [CapTransferSlot; MAX_CAP_TRANSFER],
    /// Client-side transfer buffer: staged client→server slots, and the
    /// client-side handles copied back by `ipc_return`.
    pub client_cap_buf: [CapTransferSlot; MAX_CAP_TRANSFER],
}

impl Connection {
    /// Create a connection under construction.
    ///
    /// Starts in `IncomeStopped`: the client is applying to build the
    /// connection, not issuing a call. The register thread flips it to
    /// `Valid` once the server has approved the registration.
    #[must_use]
    pub fn new(
        client_thread: ObjectRef,
        client_badge: Badge,
        client_pid: i32,
        shm: ShmDescriptor,
    ) -> Self {
        Self {
            state: ConnState::IncomeStopped,
            ownership: IpcLock::new(),
            client_badge,
            client_pid,
            current_client_thread: client_thread,
            server_handler_thread: ObjectRef::NULL,
            shm,
            conn_cap_in_client: Cap::from_raw(0),
            conn_cap_in_server: Cap::from_raw(0),
            server_cap_buf: [CapTransferSlot::INVALID; MAX_CAP_TRANSFER],
            client_cap_buf: [CapTransferSlot::INVALID; MAX_CAP_TRANSFER],
        }
    }

    /// Invalidate the server-side transfer buffer.
    ///
    /// Called at the start of each call cycle so stale capabilities from
    /// a previous cycle are never visible.
    pub fn invalidate_server_buf(&mut self) {
        self.server_cap_buf = [CapTransferSlot::INVALID; MAX_CAP_TRANSFER];
    }

    /// Invalidate the client-side transfer buffer.
    ///
    /// Called before the server→client copy of each reply.
    pub fn invalidate_client_buf(&mut self) {
        self.client_cap_buf = [CapTransferSlot::INVALID; MAX_CAP_TRANSFER];
    }
}

/// Configuration of a server thread that declared an IPC service.
///
/// This thread is the one clients name in `register_client`.
pub struct ServerConfig {
    /// Entry point of the service's IPC routine, passed to the register
    /// thread on each registration.
    pub declared_ipc_routine: VirtAddr,
    /// The thread handling client registrations for this service.
    pub register_thread: ObjectRef,
}

/// Configuration of a register thread.
pub struct RegisterCbConfig {
    /// Serialises registrations: one client at a time. Locked by the
    /// registering client, released by the register thread when it
    /// completes the handshake.
    pub register_lock: IpcLock,
    /// Entry PC the register thread always resumes from.
    pub entry: VirtAddr,
    /// Entry SP the register thread always resumes from.
    pub stack: VirtAddr,
    /// Destructor entry recorded at service declaration, handed on to
    /// each handler config.
    pub destructor: VirtAddr,
    /// Connection handle in the client table, for the in-progress
    /// registration.
    pub conn_cap_in_client: Cap,
    /// Connection handle in the server table, for the in-progress
    /// registration.
    pub conn_cap_in_server: Cap,
    /// Server-side shared-memory handle, for the in-progress
    /// registration.
    pub shm_cap_in_server: Cap,
}

impl RegisterCbConfig {
    /// Create a config resuming at the given entry state.
    #[must_use]
    pub fn new(entry: VirtAddr, stack: VirtAddr, destructor: VirtAddr) -> Self {
        Self {
            register_lock: IpcLock::new(),
            entry,
            stack,
            destructor,
            conn_cap_in_client: Cap::from_raw(0),
            conn_cap_in_server: Cap::from_raw(0),
            shm_cap_in_server: Cap::from_raw(0),
        }
    }
}

/// Configuration of a handler thread.
///
/// One handler thread may serve multiple connections; the config is
/// created lazily the first time the thread is named in a completed
/// registration and reused thereafter.
pub struct HandlerConfig {
    /// Serialises use of this handler thread: one in-flight call at a
    /// time even across connections. Locked by the calling client,
    /// released by the handler in `ipc_return`.
    pub ipc_lock: IpcLock,
    /// Entry PC the handler serves every call from.
    pub entry: VirtAddr,
    /// Entry SP the handler serves every call from.
    pub stack: VirtAddr,
    /// Entry of the exit routine run on forced teardown.
    pub exit_routine: VirtAddr,
    /// Destructor the exit routine receives when the client process has
    /// exited.
    pub destructor: VirtAddr,
    /// The connection whose call is currently being served.
    pub active_conn: ObjectRef,
}

impl HandlerConfig {
    /// Create a config serving calls from the given entry state.
    #[must_use]
    pub fn new(entry: VirtAddr, stack: VirtAddr, exit_routine: VirtAddr, destructor: VirtAddr) -> Self {
        Self {
            ipc_lock: IpcLock::new(),
            entry,
            stack,
            exit_routine,
            destructor,
            active_conn: ObjectRef::NULL,
        }
    }
}

/// Per-thread IPC configuration.
///
/// A thread holds at most one role: a service declaration, a registration
/// callback, or a handler. The variant doubles as the "has this thread
/// declared / been initialised" flag.
#[derive(Default)]
pub enum IpcConfig {
    /// No IPC role.
    #[default]
    None,
    /// This thread declared a service.
    Server(ServerConfig),
    /// This thread processes registrations.
    RegisterCb(RegisterCbConfig),
    /// This thread serves IPC calls.
    Handler(HandlerConfig),
}

impl IpcConfig {
    /// Check whether the thread has no IPC role yet.
    #[inline]
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Get the service declaration, if any.
    #[must_use]
    pub fn server(&self) -> Option<&ServerConfig> {
        match self {
            Self::Server(c) => Some(c),
            _ => None,
        }
    }

    /// Get the registration-callback config, if any.
    #[must_use]
    pub fn register_cb(&self) -> Option<&RegisterCbConfig> {
        match self {
            Self::RegisterCb(c) => Some(c),
            _ => None,
        }
    }

    /// Get the registration-callback config mutably, if any.
    #[must_use]
    pub fn register_cb_mut(&mut self) -> Option<&mut RegisterCbConfig> {
        match self {
            Self::RegisterCb(c) => Some(c),
            _ => None,
        }
    }

    /// Get the handler config, if any.
    #[must_use]
    pub fn handler(&self) -> Option<&HandlerConfig> {
        match self {
            Self::Handler(c) => Some(c),
            _ => None,
        }
    }

    /// Get the handler config mutably, if any.
    #[must_use]
    pub fn handler_mut(&mut self) -> Option<&mut HandlerConfig> {
        match self {
            Self::Handler(c) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ShmDescriptor {
        ShmDescriptor {
            client_uaddr: VirtAddr::new(0x5000_0000),
            server_uaddr: VirtAddr::new(0),
            size: 0x1000,
            cap_in_client: Cap::from_raw(1),
            cap_in_server: Cap::from_raw(0),
        }
    }

    #[test]
    fn test_new_connection_is_income_stopped() {
        let conn = Connection::new(
            ObjectRef::from_index(2),
            Badge::new(0xA),
            7,
            descriptor(),
        );
        assert_eq!(conn.state, ConnState::IncomeStopped);
        assert!(conn.server_handler_thread.is_null());
        assert!(!conn.ownership.is_locked());
    }

    #[test]
    fn test_buffer_invalidation() {
        let mut conn = Connection::new(
            ObjectRef::from_index(2),
            Badge::new(0xA),
            7,
            descriptor(),
        );
        conn.server_cap_buf[3].valid = true;
        conn.client_cap_buf[1].valid = true;
        conn.invalidate_server_buf();
        assert!(!conn.server_cap_buf[3].valid);
        assert!(conn.client_cap_buf[1].valid);
        conn.invalidate_client_buf();
        assert!(!conn.client_cap_buf[1].valid);
    }
}
