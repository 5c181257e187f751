//! Request identifiers and the small state/status enums shared by the
//! runtime and wire layers.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a single outstanding asynchronous call, memory transfer or
/// other queued command.
///
/// `u64::MAX` is reserved as [`RequestId::INVALID`], mirroring the sentinel
/// pattern used for thread/correlation ids throughout this codebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Returned by operations that could not enqueue a command.
    pub const INVALID: RequestId = RequestId(u64::MAX);

    pub const fn new(raw: u64) -> Self {
        RequestId(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        RequestId::INVALID
    }
}

/// Monotonic generator for [`RequestId`] values, one per [`Context`].
///
/// Skips [`RequestId::INVALID`] on wraparound; at one request per
/// nanosecond this takes over 580 years to wrap, but the skip is free so
/// we keep it rather than document a false invariant.
#[derive(Debug)]
pub struct RequestIdGen {
    next: AtomicU64,
}

impl RequestIdGen {
    pub const fn new() -> Self {
        RequestIdGen { next: AtomicU64::new(0) }
    }

    pub fn issue(&self) -> RequestId {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != RequestId::INVALID.as_u64() {
                return RequestId::new(id);
            }
        }
    }
}

impl Default for RequestIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of a [`Context`]. `Exit` is absorbing: once reached, a
/// context never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextState {
    Unknown = 0,
    Running = 1,
    Exit = 2,
}

impl ContextState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, ContextState::Exit)
    }
}

/// Open/closed state of a [`CommQueue`]'s request queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueState {
    Ready = 0,
    Closed = 1,
}

/// Completion status recorded on a [`Command`] once it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandStatus {
    Unfinished = 0,
    Ok = 1,
    Exception = 2,
    Error = 3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_is_not_valid() {
        assert!(!RequestId::INVALID.is_valid());
        assert!(RequestId::new(0).is_valid());
    }

    #[test]
    fn gen_issues_increasing_ids_and_skips_invalid() {
        let gen = RequestIdGen::new();
        let a = gen.issue();
        let b = gen.issue();
        assert!(a.as_u64() < b.as_u64());

        let gen = RequestIdGen { next: AtomicU64::new(u64::MAX - 1) };
        let first = gen.issue();
        assert_eq!(first.as_u64(), u64::MAX - 1);
        let second = gen.issue();
        assert_ne!(second, RequestId::INVALID);
        assert_eq!(second.as_u64(), 0);
    }

    #[test]
    fn context_state_is_terminal() {
        assert!(ContextState::Exit.is_terminal());
        assert!(!ContextState::Running.is_terminal());
    }
}
