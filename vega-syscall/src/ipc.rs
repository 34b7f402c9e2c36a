//! IPC ABI definitions
//!
//! The connection-based IPC path carries no structured message format:
//! a connection binds exactly one shared-memory region, and a call moves
//! control (not data) between the two processes. The definitions here are
//! the argument shapes both sides agree on.
//!
//! # Calling conventions
//!
//! The kernel enters server-side threads at recorded entry points with
//! arguments placed in the first argument registers:
//!
//! - **Register thread** (registration callback), entered from
//!   `RegisterClient`:
//!   `arg0 = declared IPC routine entry`.
//!   It finishes with `IpcRegisterCbReturn(handler_thread_cap,
//!   exit_routine_entry, server_shm_addr)`.
//!
//! - **Handler thread**, entered from `IpcCall`:
//!   `arg0 = server-side shm address`, `arg1 = shm size`,
//!   `arg2 = transferred-capability count`, `arg3 = client badge`.
//!   It finishes with `IpcReturn(ret, cap_num)`.
//!
//! - **Handler exit routine**, entered during connection recycling:
//!   `arg0 = destructor entry (0 if the client process still runs)`,
//!   `arg1 = client badge`, `arg2 = server-side shm address`,
//!   `arg3 = shm size`.
//!   It finishes with `IpcExitRoutineReturn()`.

use vega_common::VirtAddr;

/// The max number of capabilities allowed to be transferred during an IPC.
pub const MAX_CAP_TRANSFER: usize = 16;

/// Sentinel passed as the connection argument of `IpcGetCap`/`IpcSetCap`
/// by a server handler thread: the kernel resolves the connection from the
/// handler's active call instead of the caller's capability table.
pub const CONN_SERVER: i64 = -1;

/// Shared-memory configuration supplied by the client at registration.
///
/// The client allocates the region and tells the kernel where to map it in
/// its own address space; the memory usage is accounted to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct ShmConfig {
    /// Client-side capability naming the shared-memory object.
    pub shm_cap: u64,
    /// Address at which to map the region in the client address space.
    pub shm_addr: VirtAddr,
}
