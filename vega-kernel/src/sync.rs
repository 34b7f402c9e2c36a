//! IPC lock primitive
//!
//! [`IpcLock`] is the lock used on every IPC-visible path: a connection's
//! `ownership`, a handler thread's `ipc_lock` and a register thread's
//! `register_lock`. It deliberately is **not** a guard-based mutex:
//!
//! - Acquisition is always a non-blocking try. Failure is reported to the
//!   caller (which maps it to a retryable error); the kernel never spins
//!   or sleeps on one of these locks.
//! - The unlocking thread is routinely a *different thread* than the one
//!   that acquired the lock, in a *different syscall*: a client locks a
//!   connection's ownership in `ipc_call` and the server's handler thread
//!   releases it in `ipc_return`. A scoped guard cannot span that, so
//!   lock and unlock are explicit operations.
//!
//! The holder of such a lock is a potentially long-running user thread,
//! which is exactly why waiting on one inside the kernel is forbidden.

use core::sync::atomic::{AtomicBool, Ordering};

/// A non-blocking lock released explicitly, possibly by another thread.
#[derive(Debug, Default)]
pub struct IpcLock {
    locked: AtomicBool,
}

impl IpcLock {
    /// Create a new, unlocked lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Try to acquire the lock.
    ///
    /// Returns `true` on success. Never blocks: on contention the caller
    /// surfaces a retryable error instead.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held. A double release is a protocol
    /// violation, not ordinary contention.
    pub fn unlock(&self) {
        let was_locked = self.locked.swap(false, Ordering::Release);
        if !was_locked {
            panic!("IpcLock released while not held");
        }
    }

    /// Check if the lock is currently held.
    ///
    /// Racy; only for assertions and logging.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}
