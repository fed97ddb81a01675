//! Operation error taxonomy shared between the agent and the wire format.
//!
//! Every failure the dispatcher can report maps to one of these variants;
//! OS-level errors are translated at the point of failure rather than leaking
//! raw errno values to the host.

use thiserror::Error;

/// Status code for a successful operation
pub const OP_OK: u64 = 0;

/// Result alias used throughout the agent
pub type OpResult<T> = Result<T, OpError>;

/// Errors reportable to the host controller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("malformed message body")]
    MalformedMessage,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("object not found")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("guest user permissions denied")]
    PermissionDenied,

    #[error("empty password not allowed in guest")]
    EmptyPasswordNotAllowed,

    #[error("operation not supported on this platform")]
    NotSupported,

    #[error("program could not be started")]
    ProgramNotStarted,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("system error (errno {0})")]
    System(i32),
}

impl OpError {
    /// Stable numeric status code reported in reply frames.
    ///
    /// System errors are offset so the original errno survives the trip to
    /// the host.
    pub fn code(&self) -> u64 {
        match self {
            OpError::MalformedMessage => 1,
            OpError::InvalidArgument => 2,
            OpError::NotFound => 3,
            OpError::NotADirectory => 4,
            OpError::PermissionDenied => 5,
            OpError::EmptyPasswordNotAllowed => 6,
            OpError::NotSupported => 7,
            OpError::ProgramNotStarted => 8,
            OpError::AuthenticationFailed => 9,
            OpError::System(errno) => 1000 + (*errno).max(0) as u64,
        }
    }

    /// Translate an I/O failure into the protocol taxonomy.
    ///
    /// The common, user-correctable cases get their own variants; everything
    /// else carries the errno.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => OpError::NotFound,
            ErrorKind::PermissionDenied => OpError::PermissionDenied,
            _ => OpError::System(err.raw_os_error().unwrap_or(-1)),
        }
    }
}

impl From<std::io::Error> for OpError {
    fn from(err: std::io::Error) -> Self {
        OpError::from_io(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_translation() {
        let nf = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(OpError::from_io(&nf), OpError::NotFound);

        let perm = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(OpError::from_io(&perm), OpError::PermissionDenied);

        let other = std::io::Error::from_raw_os_error(libc_enosys());
        assert_eq!(OpError::from_io(&other), OpError::System(libc_enosys()));
    }

    // avoid a libc dev-dependency just for one constant
    fn libc_enosys() -> i32 {
        38
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(OpError::MalformedMessage.code(), 1);
        assert_eq!(OpError::System(13).code(), 1013);
    }
}
