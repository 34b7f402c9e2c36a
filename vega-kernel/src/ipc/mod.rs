//! Connection-based Inter-Process Communication
//!
//! A connection binds a client process to a server process. The
//! connection capability is held in the client's table, so each thread in
//! the client process can use it; it is served by exactly one handler
//! thread, while one handler thread may serve multiple connections. One
//! shared-memory object is bound to each connection, and a connection
//! serves one call at a time.
//!
//! # Registration (control path)
//!
//! - A server thread S1 declares a service with `register_server`,
//!   naming a register thread S2.
//! - A client thread C invokes `register_client(S1)`, which switches
//!   directly into S2.
//! - S2 invokes `ipc_register_cb_return` naming a handler thread S3 that
//!   will serve the calls, and the kernel switches back to C with the new
//!   connection capability as C's return value.
//!
//! # Call/return (data path)
//!
//! - C invokes `ipc_call`, which switches directly into S3, donating C's
//!   scheduling context.
//! - S3 invokes `ipc_return`, which switches back to C.
//!
//! There is no kernel-side message copy and no scheduler round-trip on
//! this path: arguments travel in the shared-memory region, and the only
//! kernel work is the lock handshake, the register setup and the switch.

pub mod call;
pub mod cap_transfer;
pub mod connection;
pub mod registration;

pub use call::{sys_ipc_call, sys_ipc_exit_routine_return, sys_ipc_return};
pub use cap_transfer::{CapSelector, sys_ipc_get_cap, sys_ipc_set_cap};
pub use connection::{ConnState, Connection, IpcConfig};
pub use registration::{sys_ipc_register_cb_return, sys_register_client, sys_register_server};
