//! `Command`: a tagged pair of closures (submit, complete) standing in for
//! the original's virtual-function `Command` subclasses, grounded on
//! `Command.hpp`/`Command.cpp`.

use aveo_core::{AveoError, RequestId, Result};

pub type SubmitFn = dyn FnMut() -> Result<()> + Send;
pub type CompleteFn = dyn FnOnce(&[u8]) -> Result<u64> + Send;

/// A single queued operation: a request id, a flag marking whether it runs
/// entirely on the host (never touches the wire), and the submit/complete
/// closures that drive it through `Context::progress`.
pub struct Command {
    id: RequestId,
    host_only: bool,
    submit: Box<SubmitFn>,
    complete: Option<Box<CompleteFn>>,
}

impl Command {
    pub fn new(
        id: RequestId,
        host_only: bool,
        submit: impl FnMut() -> Result<()> + Send + 'static,
        complete: impl FnOnce(&[u8]) -> Result<u64> + Send + 'static,
    ) -> Self {
        Command { id, host_only, submit: Box::new(submit), complete: Some(Box::new(complete)) }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn is_host_only(&self) -> bool {
        self.host_only
    }

    pub fn submit(&mut self) -> Result<()> {
        (self.submit)()
    }

    /// Runs the completion closure, consuming the command. `payload` is the
    /// raw reply bytes for wire-bound commands, or an empty slice for
    /// host-only commands that already computed their result during submit.
    pub fn complete(mut self, payload: &[u8]) -> (RequestId, Result<u64>) {
        let f = self.complete.take().expect("Command::complete called twice");
        (self.id, f(payload))
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command").field("id", &self.id).field("host_only", &self.host_only).finish()
    }
}

/// Convenience for building the `Err` a cancelled command resolves to.
pub fn cancelled_result() -> Result<u64> {
    Err(AveoError::QueueClosed)
}
