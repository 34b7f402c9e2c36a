//! Thread scheduling primitives
//!
//! The IPC fast path does not queue or sleep: "the client blocks" means
//! "the server thread runs instead", implemented as a direct context
//! switch plus a thread-state flag. This module provides that primitive
//! and the thread-state helpers the IPC paths use.
//!
//! # The `Switched` token
//!
//! [`sched_to_thread`] and [`reschedule`] return a [`Switched`] token that
//! only this module can mint. IPC entry points that transfer control away
//! from the caller return `Result<Switched, SysError>`: an `Ok` proves the
//! calling thread no longer runs and no value may be written to its return
//! register. This replaces the "this function never returns" convention of
//! a context-switching kernel with something the type system checks.

pub mod context;

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::collections::VecDeque;
use spin::{Mutex, Once};

use vega_cap::ObjectRef;

use crate::cap::object_table;
use crate::object::{ExitState, ThreadState};

/// Proof that control has been transferred away from the calling thread.
///
/// Constructed only by [`sched_to_thread`] and [`reschedule`].
#[must_use = "a transferred control flow must be propagated to the dispatcher"]
pub struct Switched {
    _priv: (),
}

/// The currently running thread (index of its [`ObjectRef`]).
static CURRENT: AtomicU32 = AtomicU32::new(0);

/// Runnable threads waiting for a CPU.
static RUN_QUEUE: Once<Mutex<VecDeque<ObjectRef>>> = Once::new();

fn run_queue() -> &'static Mutex<VecDeque<ObjectRef>> {
    RUN_QUEUE.call_once(|| Mutex::new(VecDeque::new()))
}

/// Get the currently running thread.
#[must_use]
pub fn current_thread() -> ObjectRef {
    ObjectRef::from_index(CURRENT.load(Ordering::Acquire))
}

/// Get the process of the currently running thread.
#[must_use]
pub fn current_cap_group() -> ObjectRef {
    object_table::with_thread(current_thread(), |t| t.cap_group).unwrap_or(ObjectRef::NULL)
}

/// Make `thread` the current thread without a scheduler decision.
///
/// Used by test harnesses and CPU bring-up to seed the running thread.
pub fn set_current_thread(thread: ObjectRef) {
    CURRENT.store(thread.index(), Ordering::Release);
    thread_set_ts_running(thread);
}

/// Switch directly to `thread`.
///
/// The target becomes the running thread immediately; the caller's own
/// state must already have been set (blocked, waiting or exited) before
/// switching.
pub fn sched_to_thread(thread: ObjectRef) -> Switched {
    thread_set_ts_running(thread);
    CURRENT.store(thread.index(), Ordering::Release);
    Switched { _priv: () }
}

/// Put `thread` on the run queue.
pub fn sched_enqueue(thread: ObjectRef) {
    run_queue().lock().push_back(thread);
}

/// Give up the CPU: run the next queued thread, or idle.
///
/// Threads that have been marked exited in the meantime are skipped.
pub fn reschedule() -> Switched {
    loop {
        let next = run_queue().lock().pop_front();
        match next {
            Some(t) => {
                let exited = object_table::with_thread(t, |th| th.is_exited()).unwrap_or(true);
                if exited {
                    continue;
                }
                return sched_to_thread(t);
            }
            None => {
                CURRENT.store(0, Ordering::Release);
                return Switched { _priv: () };
            }
        }
    }
}

/// Empty the run queue between tests sharing the global scheduler state.
#[cfg(test)]
pub(crate) fn reset_run_queue() {
    run_queue().lock().clear();
    CURRENT.store(0, Ordering::Release);
}

/// Mark `thread` as blocked inside an IPC call.
pub fn thread_set_ts_blocking(thread: ObjectRef) {
    object_table::with_thread_mut(thread, |t| t.state = ThreadState::Blocking);
}

/// Mark `thread` as parked at its entry point, ready to be invoked.
pub fn thread_set_ts_waiting(thread: ObjectRef) {
    object_table::with_thread_mut(thread, |t| t.state = ThreadState::Waiting);
}

/// Mark `thread` as runnable.
pub fn thread_set_ts_running(thread: ObjectRef) {
    object_table::with_thread_mut(thread, |t| t.state = ThreadState::Running);
}

/// Mark `thread` as fully exited; it will never be scheduled again.
pub fn thread_set_exited(thread: ObjectRef) {
    object_table::with_thread_mut(thread, |t| t.exit_state = ExitState::Exited);
}

/// Check whether `thread` has been marked for exit.
#[must_use]
pub fn thread_is_exiting(thread: ObjectRef) -> bool {
    object_table::with_thread(thread, |t| t.is_exiting()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use vega_cap::Badge;

    use crate::cap::object_table::KernelObject;
    use crate::object::{CapGroupObject, ThreadObject, ThreadType};
    use crate::sched::context::ArchContext;

    fn make_thread() -> ObjectRef {
        let group = object_table::alloc(KernelObject::CapGroup(Box::new(CapGroupObject::new(
            Badge::new(0x99),
            9,
        ))))
        .unwrap();
        object_table::alloc(KernelObject::Thread(Box::new(ThreadObject::new(
            group,
            ThreadType::User,
            ArchContext::default(),
        ))))
        .unwrap()
    }

    #[test]
    fn test_switch_sets_current() {
        let _guard = crate::test_support::kernel_lock();
        let t = make_thread();
        let _switched = sched_to_thread(t);
        assert_eq!(current_thread(), t);
        assert_eq!(
            object_table::with_thread(t, |th| th.state),
            Some(ThreadState::Running)
        );
    }

    #[test]
    fn test_reschedule_skips_exited() {
        let _guard = crate::test_support::kernel_lock();
        let a = make_thread();
        let b = make_thread();
        thread_set_exited(a);
        sched_enqueue(a);
        sched_enqueue(b);
        let _switched = reschedule();
        assert_eq!(current_thread(), b);
    }
}
