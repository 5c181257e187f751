//! Crate-wide error type.
//!
//! Plain hand-rolled enum with manual `Display`/`Error` impls, matching the
//! rest of this codebase's error style rather than pulling in `thiserror`.

use core::fmt;

pub type Result<T> = std::result::Result<T, AveoError>;

#[derive(Debug)]
pub enum AveoError {
    /// The accelerator process or context has already transitioned to EXIT.
    AlreadyExited,
    /// A command could not be submitted because the request queue is closed.
    QueueClosed,
    /// Waited past the configured timeout for a reply.
    Timeout,
    /// The worker reported an exception while executing a call.
    Exception { code: i64, message: String },
    /// A frame from the transport did not match the expected reply shape.
    ProtocolViolation(&'static str),
    /// A symbol or library name exceeded the wire-format length limit.
    NameTooLong,
    /// Library or symbol lookup failed on the worker side.
    NotFound(&'static str),
    /// Stack/argument image exceeded `MAX_NUM_ARGS` or alignment bounds.
    InvalidArgs(&'static str),
    /// Underlying OS call failed; carries the raw `errno`.
    Os(i32),
    /// Transport-level failure (peer creation, shared memory, ring full).
    Transport(&'static str),
}

impl fmt::Display for AveoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AveoError::AlreadyExited => write!(f, "context has already exited"),
            AveoError::QueueClosed => write!(f, "request queue is closed"),
            AveoError::Timeout => write!(f, "timed out waiting for reply"),
            AveoError::Exception { code, message } => {
                write!(f, "worker exception {}: {}", code, message)
            }
            AveoError::ProtocolViolation(what) => write!(f, "protocol violation: {}", what),
            AveoError::NameTooLong => write!(f, "library or symbol name too long"),
            AveoError::NotFound(what) => write!(f, "not found: {}", what),
            AveoError::InvalidArgs(what) => write!(f, "invalid call arguments: {}", what),
            AveoError::Os(errno) => write!(f, "os error (errno {})", errno),
            AveoError::Transport(what) => write!(f, "transport error: {}", what),
        }
    }
}

impl std::error::Error for AveoError {}

impl AveoError {
    /// Convert to the `0`/`-1`/negative-errno style the `aveo` facade
    /// surfaces to callers, matching the split the C API used between an
    /// internal `Result` and an ABI-facing `int`.
    pub fn to_errno(&self) -> i32 {
        match self {
            AveoError::Os(errno) => -errno.abs().max(1),
            _ => -1,
        }
    }
}
