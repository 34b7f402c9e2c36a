//! Kernel object definitions
//!
//! The object types stored in the kernel object table:
//!
//! - [`CapGroupObject`]: a process — badge, capability table, address
//!   space mappings and thread list
//! - [`ThreadObject`]: a thread — type, run/exit state, scheduling
//!   context, register context and per-thread IPC configuration
//! - [`ShmObject`]: a shared-memory object backing a connection
//!
//! The IPC connection object lives with its protocol in
//! [`crate::ipc::connection`].

pub mod cap_group;
pub mod shm;
pub mod thread;

pub use cap_group::{CapGroupObject, VmMapping, Vmspace};
pub use shm::ShmObject;
pub use thread::{ExitState, SchedContext, ThreadObject, ThreadState, ThreadType};
