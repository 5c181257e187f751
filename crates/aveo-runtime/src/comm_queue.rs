//! `CommQueue`: the request/in-flight/completion triple a `Context` drains
//! in its progress loop. Grounded on `Command.hpp`'s `CommQueue`.

use std::sync::Mutex;
use std::time::Duration;

use aveo_core::{AveoError, RequestId, Result};

use crate::command::Command;
use crate::queue::{BlockingMap, BlockingQueue};

pub struct CommQueue {
    pub request: BlockingQueue<Command>,
    inflight: Mutex<Option<Command>>,
    pub completion: BlockingMap<RequestId, Result<u64>>,
}

impl CommQueue {
    pub fn new() -> Self {
        CommQueue { request: BlockingQueue::new(), inflight: Mutex::new(None), completion: BlockingMap::new() }
    }

    pub fn push_request(&self, cmd: Command) -> Result<()> {
        self.request.push(cmd).map_err(|_| AveoError::QueueClosed)
    }

    pub fn push_request_front(&self, cmd: Command) -> Result<()> {
        self.request.push_front(cmd).map_err(|_| AveoError::QueueClosed)
    }

    pub fn try_pop_request(&self) -> Option<Command> {
        self.request.try_pop()
    }

    pub fn inflight_is_empty(&self) -> bool {
        self.inflight.lock().unwrap().is_none()
    }

    /// Installs `cmd` as the single in-flight command. Panics if the slot is
    /// already occupied — the progress loop must never call this without
    /// having checked [`CommQueue::inflight_is_empty`] first.
    pub fn set_inflight(&self, cmd: Command) {
        let mut slot = self.inflight.lock().unwrap();
        assert!(slot.is_none(), "in-flight slot already occupied");
        *slot = Some(cmd);
    }

    pub fn take_inflight(&self) -> Option<Command> {
        self.inflight.lock().unwrap().take()
    }

    pub fn push_completion(&self, id: RequestId, result: Result<u64>) {
        self.completion.insert(id, result);
    }

    pub fn peek_completion(&self, id: &RequestId) -> Option<Result<u64>> {
        self.completion.try_find(id)
    }

    pub fn wait_completion(&self, id: &RequestId, timeout: Duration) -> Option<Result<u64>> {
        self.completion.wait(id, timeout)
    }

    pub fn is_idle(&self) -> bool {
        self.request.is_empty() && self.inflight_is_empty()
    }

    pub fn close_requests(&self) {
        self.request.close();
    }

    /// Drains every pending request and the in-flight command, if any, into
    /// the completion map as `Err(AveoError::QueueClosed)`. Used when a
    /// context transitions to `Exit`.
    pub fn cancel_all(&self) {
        self.request.drain_into(|cmd| {
            let (id, _) = cmd.complete(&[]);
            self.completion.insert(id, Err(AveoError::QueueClosed));
        });
        if let Some(cmd) = self.take_inflight() {
            let (id, _) = cmd.complete(&[]);
            self.completion.insert(id, Err(AveoError::QueueClosed));
        }
    }
}

impl Default for CommQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_command(id: u64) -> Command {
        Command::new(RequestId::new(id), false, || Ok(()), |_| Ok(0))
    }

    #[test]
    fn cancel_all_resolves_every_pending_and_inflight_id() {
        let q = CommQueue::new();
        q.push_request(noop_command(1)).unwrap();
        q.push_request(noop_command(2)).unwrap();
        q.set_inflight(noop_command(3));

        q.cancel_all();

        for id in [1u64, 2, 3] {
            let result = q.peek_completion(&RequestId::new(id));
            assert!(matches!(result, Some(Err(AveoError::QueueClosed))));
        }
        assert!(q.is_idle());
    }

    #[test]
    fn inflight_slot_holds_exactly_one() {
        let q = CommQueue::new();
        assert!(q.inflight_is_empty());
        q.set_inflight(noop_command(1));
        assert!(!q.inflight_is_empty());
        let cmd = q.take_inflight().unwrap();
        assert_eq!(cmd.id(), RequestId::new(1));
        assert!(q.inflight_is_empty());
    }
}
