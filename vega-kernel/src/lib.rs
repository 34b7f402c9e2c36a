//! # vega-kernel
//!
//! The Vega microkernel library. The centrepiece is the connection-based
//! IPC subsystem: synchronous cross-process calls carried by direct
//! thread-to-thread control transfer, with a shared-memory region per
//! connection and no kernel-side message copying.
//!
//! # Subsystems
//!
//! - [`cap`]: kernel object table and capability operations
//! - [`object`]: kernel object definitions (processes, threads, memory)
//! - [`sched`]: thread states and the direct-switch primitive
//! - [`ipc`]: connection registration, the call/return fast path and
//!   capability transfer
//! - [`recycle`]: cooperative teardown of connections and their
//!   server-side resources
//! - [`syscall`]: the numbered syscall dispatcher and error codes
//!
//! # Locking discipline
//!
//! Every lock on the IPC path is acquired with a non-blocking try and
//! contention is surfaced to the caller as a retryable error. The kernel
//! never sleeps while holding an IPC-visible lock; see [`sync::IpcLock`].

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod cap;
pub mod ipc;
pub mod logging;
pub mod object;
pub mod recycle;
pub mod sched;
pub mod sync;
pub mod syscall;

#[cfg(test)]
pub(crate) mod test_support;
