//! Thread objects
//!
//! A thread is the unit of execution and the anchor of the IPC protocol:
//! server threads carry their service configuration, client threads are
//! the targets that replies switch back into.
//!
//! # Thread kinds
//!
//! - `User`: an ordinary thread created by its process.
//! - `Register`: a server-side thread dedicated to processing client
//!   registrations for one declared service.
//! - `Shadow`: a server-side handler thread. It has no scheduling context
//!   of its own; it runs on whatever context the calling client donates,
//!   which is also what makes a chained call (A calls B, B calls C) run
//!   entirely on A's budget.

use vega_cap::ObjectRef;

use crate::ipc::connection::IpcConfig;
use crate::sched::context::ArchContext;

/// Thread kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ThreadType {
    /// Ordinary thread.
    #[default]
    User = 0,
    /// Server handler thread serving IPC calls.
    Shadow = 1,
    /// Server thread serving client registrations.
    Register = 2,
}

/// Thread run state.
///
/// There is no kernel wait queue on the IPC path: "blocked" simply means
/// another thread runs instead, and the reply path switches straight back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ThreadState {
    /// Created, not yet started.
    #[default]
    Init = 0,
    /// Runnable or currently running.
    Running = 1,
    /// Blocked inside an IPC call, waiting for the peer to switch back.
    Blocking = 2,
    /// Parked at its entry point waiting to be invoked (register and
    /// handler threads between requests).
    Waiting = 3,
}

/// Thread exit progression, advanced by the recycling sweep.
///
/// Kept separate from the run state: an exiting thread may still be
/// observed `Blocking` inside an in-flight call, and the call/return
/// paths use this field to decide whether to short-circuit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ExitState {
    /// Not exiting.
    #[default]
    Running = 0,
    /// Marked for exit; IPC paths must not start new work on it.
    Exiting = 1,
    /// Fully exited; never scheduled again.
    Exited = 2,
}

/// Scheduling context: the budget/priority record a thread runs on.
///
/// During an IPC call the client's context is donated to the server's
/// handler thread, so the server executes with the client's priority and
/// budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedContext {
    /// Time budget in ticks.
    pub budget: u32,
    /// Priority; higher runs first.
    pub prio: u32,
}

impl SchedContext {
    /// Default budget for kernel-created contexts.
    pub const DEFAULT_BUDGET: u32 = 100;

    /// Default priority for kernel-created contexts.
    pub const DEFAULT_PRIO: u32 = 10;
}

impl Default for SchedContext {
    fn default() -> Self {
        Self {
            budget: Self::DEFAULT_BUDGET,
            prio: Self::DEFAULT_PRIO,
        }
    }
}

/// Thread object.
pub struct ThreadObject {
    /// Owning process.
    pub cap_group: ObjectRef,
    /// Thread kind.
    pub ttype: ThreadType,
    /// Run state.
    pub state: ThreadState,
    /// Exit progression.
    pub exit_state: ExitState,
    /// Scheduling context; `None` for a passive server thread between
    /// requests.
    pub sc: Option<SchedContext>,
    /// Saved register state.
    pub ctx: ArchContext,
    /// Per-thread IPC configuration (service declaration, registration
    /// callback state or handler state).
    pub ipc_config: IpcConfig,
}

impl ThreadObject {
    /// Create a thread of the given kind in `cap_group`, entering at the
    /// given register context.
    #[must_use]
    pub fn new(cap_group: ObjectRef, ttype: ThreadType, ctx: ArchContext) -> Self {
        Self {
            cap_group,
            ttype,
            state: ThreadState::Init,
            exit_state: ExitState::Running,
            sc: match ttype {
                // Passive server threads run on donated contexts only.
                ThreadType::Shadow | ThreadType::Register => None,
                ThreadType::User => Some(SchedContext::default()),
            },
            ctx,
            ipc_config: IpcConfig::None,
        }
    }

    /// Check whether this thread has been marked for exit (or beyond).
    #[inline]
    #[must_use]
    pub fn is_exiting(&self) -> bool {
        !matches!(self.exit_state, ExitState::Running)
    }

    /// Check whether this thread has fully exited.
    #[inline]
    #[must_use]
    pub fn is_exited(&self) -> bool {
        matches!(self.exit_state, ExitState::Exited)
    }
}
