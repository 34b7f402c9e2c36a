//! Syscall dispatch
//!
//! Routes raw syscall numbers and argument registers to the IPC entry
//! points and converts their results into either a value for the caller's
//! return register or the fact that control has already moved to another
//! thread.

pub mod error;

use vega_cap::{Cap, CapRights, ObjectRef};
use vega_common::VirtAddr;
use vega_syscall::{CONN_SERVER, ShmConfig, Syscall};

use crate::ipc::cap_transfer::{self, CapSelector};
use crate::ipc::{call, registration};
use crate::recycle;
use crate::sched::Switched;
use error::SysError;

/// Outcome of a dispatched syscall.
pub enum Outcome {
    /// Write this value to the calling thread's return register.
    Return(i64),
    /// Control has been transferred; the calling thread no longer runs
    /// and nothing is written to its registers.
    Switched(Switched),
}

impl From<Switched> for Outcome {
    fn from(s: Switched) -> Self {
        Self::Switched(s)
    }
}

impl Outcome {
    fn from_switch(result: Result<Switched, SysError>) -> Self {
        match result {
            Ok(s) => Self::Switched(s),
            Err(e) => Self::Return(e.as_i64()),
        }
    }
}

/// Decode a capability-or-sentinel argument of the transfer syscalls.
fn cap_selector(raw: u64) -> CapSelector {
    if raw as i64 == CONN_SERVER {
        CapSelector::Server
    } else {
        CapSelector::Conn(Cap::from_raw(raw as u32))
    }
}

/// Dispatch one syscall for the current thread.
///
/// `args` are the caller's argument registers in order.
pub fn dispatch(nr: u64, args: [u64; 5]) -> Outcome {
    let Some(syscall) = Syscall::from_raw(nr) else {
        return Outcome::Return(SysError::InvalidSyscall.as_i64());
    };

    match syscall {
        Syscall::IpcCall => Outcome::from_switch(call::sys_ipc_call(
            Cap::from_raw(args[0] as u32),
            args[1] as usize,
        )),

        Syscall::IpcReturn => {
            Outcome::from_switch(call::sys_ipc_return(args[0], args[1] as usize))
        }

        Syscall::IpcSetCap => match cap_transfer::sys_ipc_set_cap(
            cap_selector(args[0]),
            args[1] as usize,
            Cap::from_raw(args[2] as u32),
            CapRights::from_bits(args[3] as u32),
            CapRights::from_bits(args[4] as u32),
        ) {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Return(e.as_i64()),
        },

        Syscall::IpcGetCap => {
            match cap_transfer::sys_ipc_get_cap(cap_selector(args[0]), args[1] as usize) {
                Ok(outcome) => outcome,
                Err(e) => Outcome::Return(e.as_i64()),
            }
        }

        Syscall::RegisterServer => match registration::sys_register_server(
            VirtAddr::new(args[0]),
            Cap::from_raw(args[1] as u32),
            VirtAddr::new(args[2]),
        ) {
            Ok(()) => Outcome::Return(0),
            Err(e) => Outcome::Return(e.as_i64()),
        },

        Syscall::RegisterClient => Outcome::from_switch(registration::sys_register_client(
            Cap::from_raw(args[0] as u32),
            ShmConfig {
                shm_cap: args[1],
                shm_addr: VirtAddr::new(args[2]),
            },
        )),

        Syscall::IpcRegisterCbReturn => {
            Outcome::from_switch(registration::sys_ipc_register_cb_return(
                Cap::from_raw(args[0] as u32),
                VirtAddr::new(args[1]),
                VirtAddr::new(args[2]),
            ))
        }

        Syscall::IpcExitRoutineReturn => Outcome::Switched(call::sys_ipc_exit_routine_return()),

        Syscall::IpcCloseConnection => {
            match recycle::sys_ipc_close_connection(Cap::from_raw(args[0] as u32)) {
                Ok(()) => Outcome::Return(0),
                Err(e) => Outcome::Return(e.as_i64()),
            }
        }
    }
}

/// Deliver an `Outcome` to `caller`'s return register.
///
/// A `Return` writes the value; a `Switched` writes nothing, since the
/// caller is no longer the running thread.
pub fn deliver(caller: ObjectRef, outcome: &Outcome) {
    if let Outcome::Return(v) = outcome {
        crate::cap::object_table::with_thread_mut(caller, |t| t.ctx.set_return(*v as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_syscall() {
        match dispatch(999, [0; 5]) {
            Outcome::Return(v) => assert_eq!(v, SysError::InvalidSyscall.as_i64()),
            Outcome::Switched(_) => panic!("unknown syscall switched control"),
        }
    }

    #[test]
    fn test_cap_selector_sentinel() {
        assert!(matches!(cap_selector(u64::MAX), CapSelector::Server));
        assert!(matches!(cap_selector(3), CapSelector::Conn(_)));
    }
}
