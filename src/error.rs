use std::io;

use thiserror::Error;

/// Errors returned by the wireline runtime.
///
/// The variants form a small kind taxonomy rather than a per-site listing:
/// synchronous APIs return these directly, event-loop dispatch converts a
/// handler failure into the terminal status of the affected object.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// User-supplied data failed validation (unparseable address, port 0 on
    /// connect, malformed host name).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An API was called in the wrong state (listen on a live acceptor,
    /// sockaddr conversion of an unresolved host-port, loop-thread-only
    /// call from another thread).
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// A name did not resolve or a lookup missed.
    #[error("not found: {0}")]
    NotFound(String),
    /// Temporary resource exhaustion; retrying later may succeed.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Something that should not fail did (kernel call, library invariant).
    #[error("internal: {0}")]
    Internal(String),
    /// The requested backend is not available on this system.
    #[error("unimplemented: {0}")]
    Unimplemented(String),
    /// The operation was cancelled before it completed.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// A system call failed; the message carries the call site context and
    /// the OS error text. The raw errno is preserved for callers that
    /// branch on it.
    #[error("{message}")]
    Io { message: String, errno: i32 },
}

impl Error {
    /// Build an [`Error::Io`] from the calling thread's `errno`, annotated
    /// with a context string naming the failed call.
    pub fn last_os(context: impl AsRef<str>) -> Self {
        let err = io::Error::last_os_error();
        Error::Io {
            message: format!("{}: {}", context.as_ref(), err),
            errno: err.raw_os_error().unwrap_or(0),
        }
    }

    /// Build an [`Error::Io`] from an explicit errno value.
    pub fn from_errno(errno: i32, context: impl AsRef<str>) -> Self {
        let err = io::Error::from_raw_os_error(errno);
        Error::Io {
            message: format!("{}: {}", context.as_ref(), err),
            errno,
        }
    }

    /// The raw OS error code, when this error wraps a failed system call.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Io { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let errno = err.raw_os_error().unwrap_or(0);
        Error::Io {
            message: err.to_string(),
            errno,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal status delivered to close handlers. `Ok(())` is a clean close.
pub type Status = std::result::Result<(), Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trip() {
        let err = Error::from_errno(libc::ECONNREFUSED, "::connect failed");
        assert_eq!(err.errno(), Some(libc::ECONNREFUSED));
        assert!(err.to_string().contains("::connect failed"));
    }

    #[test]
    fn kinds_have_no_errno() {
        assert_eq!(Error::NotFound("x".into()).errno(), None);
        assert_eq!(Error::Unavailable("x".into()).errno(), None);
    }
}
