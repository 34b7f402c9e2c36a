//! Syscall numbers
//!
//! Defines the syscall ABI for the Vega microkernel:
//! - x7: syscall number
//! - x0-x3: arguments
//! - x0: return value (negative = error)

/// Syscall numbers.
///
/// Low numbers are reserved for the high-frequency IPC data path.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    // === IPC data path (high-frequency, low numbers) ===
    /// Issue a synchronous call on a connection.
    IpcCall = 0,
    /// Return from a handler thread to the calling client.
    IpcReturn = 1,
    /// Stage a capability for transfer on the current call.
    IpcSetCap = 2,
    /// Fetch a transferred capability from the current call.
    IpcGetCap = 3,

    // === IPC control path ===
    /// Declare an IPC service on the calling server thread.
    RegisterServer = 8,
    /// Register the calling client with a declared service.
    RegisterClient = 9,
    /// Complete a pending registration (register thread only).
    IpcRegisterCbReturn = 10,
    /// Return from a handler thread's forced exit routine.
    IpcExitRoutineReturn = 11,
    /// Close a connection from the client side.
    IpcCloseConnection = 12,
}

impl Syscall {
    /// Decode a raw syscall number.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => Self::IpcCall,
            1 => Self::IpcReturn,
            2 => Self::IpcSetCap,
            3 => Self::IpcGetCap,
            8 => Self::RegisterServer,
            9 => Self::RegisterClient,
            10 => Self::IpcRegisterCbReturn,
            11 => Self::IpcExitRoutineReturn,
            12 => Self::IpcCloseConnection,
            _ => return None,
        })
    }
}
