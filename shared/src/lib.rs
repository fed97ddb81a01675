//! GuestOps Shared Protocol Types
//!
//! This crate provides the wire format, request decoding and error taxonomy
//! for the host-to-guest automation protocol. The host-side controller sends
//! opaque binary command envelopes to the in-guest agent, which executes them
//! and returns a status code plus an optional result buffer.

pub mod codec;
pub mod error;
pub mod wire;

use std::time::{SystemTime, UNIX_EPOCH};

pub use error::{OpError, OpResult, OP_OK};
pub use wire::{CommonHeader, Envelope, EnvelopeBuilder, COMMON_HEADER_LEN};

/// Get current timestamp in seconds since Unix epoch
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Protocol-wide timing and retention parameters
pub mod limits {
    /// Interval between liveness polls of a launched program, in seconds
    pub const SECONDS_BETWEEN_POLL: u64 = 1;

    /// How long a terminal exited-program record stays queryable
    pub const EXITED_PROGRAM_REAP_SECS: u64 = 5 * 60;

    /// Upper bound on a serialized process-list result
    pub const MAX_PROCESS_LIST_RESULT_LENGTH: usize = 81920;
}

/// Command opcodes carried in the envelope common header.
///
/// Unlisted values are deliberately not an error at dispatch time: the
/// dispatcher answers them with an empty success so older agents stay
/// compatible with newer controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    CheckUserAccount = 1,
    Logout = 2,
    RunProgram = 10,
    StartProgram = 11,
    RunScript = 12,
    KillProcess = 13,
    ListProcesses = 14,
    ListProcessesEx = 15,
    ReadVariable = 20,
    WriteVariable = 21,
    ReadEnvVariables = 22,
    DeleteFile = 30,
    DeleteDirectory = 31,
    FileExists = 32,
    DirectoryExists = 33,
    MoveFile = 34,
    MoveDirectory = 35,
    CreateDirectory = 36,
    ListDirectory = 37,
    GetFileInfo = 38,
    CreateTempFile = 39,
    CreateTempDirectory = 40,
    ForwardSharePacket = 50,
}

impl Opcode {
    /// Map a raw opcode to a known command, if any
    pub fn from_u32(raw: u32) -> Option<Self> {
        use Opcode::*;
        Some(match raw {
            1 => CheckUserAccount,
            2 => Logout,
            10 => RunProgram,
            11 => StartProgram,
            12 => RunScript,
            13 => KillProcess,
            14 => ListProcesses,
            15 => ListProcessesEx,
            20 => ReadVariable,
            21 => WriteVariable,
            22 => ReadEnvVariables,
            30 => DeleteFile,
            31 => DeleteDirectory,
            32 => FileExists,
            33 => DirectoryExists,
            34 => MoveFile,
            35 => MoveDirectory,
            36 => CreateDirectory,
            37 => ListDirectory,
            38 => GetFileInfo,
            39 => CreateTempFile,
            40 => CreateTempDirectory,
            50 => ForwardSharePacket,
            _ => return None,
        })
    }
}

/// Credential descriptor kinds carried in `CommonHeader::credential_type`
pub mod credential_type {
    /// Act as the privileged system identity (root / LocalSystem)
    pub const PRIVILEGED_SYSTEM: u32 = 1;
    /// Act as the owner of the interactive console session
    pub const SESSION_OWNER: u32 = 2;
    /// Named user plus plain secret
    pub const NAME_PASSWORD: u32 = 3;
    /// Named user plus obfuscated secret
    pub const NAME_PASSWORD_OBFUSCATED: u32 = 4;
    /// Named user that must match the identity the agent itself runs as
    pub const NAMED_CURRENT_USER: u32 = 5;
}

/// Guest variable namespaces for ReadVariable / WriteVariable
pub mod variable_scope {
    /// Environment of programs the agent will launch
    pub const GUEST_ENVIRONMENT: u32 = 1;
    /// Free-form per-agent variable store
    pub const GUEST_VARIABLE: u32 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrip() {
        assert_eq!(Opcode::from_u32(11), Some(Opcode::StartProgram));
        assert_eq!(Opcode::from_u32(50), Some(Opcode::ForwardSharePacket));
        assert_eq!(Opcode::from_u32(9999), None);
    }

    #[test]
    fn now_secs_is_nonzero() {
        assert!(now_secs() > 0);
    }
}
