//! In-process transport standing in for a worker process.
//!
//! This is the test vehicle for everything above the transport seam: the
//! worker-side command loop and ABI trampoline are out of scope for this
//! crate, so `LoopbackTransport` plays only the passive wire-contract role
//! a worker would — it never contains accelerator-specific logic, just
//! enough to let `aveo-runtime`'s progress engine, `CommQueue` and
//! `CallArgs` paths be exercised without real hardware.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use aveo_core::{AveoError, Result};

use crate::transport::Transport;

type Responder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

static NEXT_LOOPBACK_PEER: AtomicI32 = AtomicI32::new(0);

struct Shared {
    completions: Mutex<VecDeque<Vec<u8>>>,
    cv: Condvar,
}

/// An in-process `Transport` that immediately hands every sent frame to a
/// caller-supplied responder and queues whatever it returns as the reply.
pub struct LoopbackTransport {
    shared: Arc<Shared>,
    responder: Responder,
    max_payload: usize,
}

impl LoopbackTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        LoopbackTransport {
            shared: Arc::new(Shared { completions: Mutex::new(VecDeque::new()), cv: Condvar::new() }),
            responder: Arc::new(responder),
            max_payload: 64 * 1024 * 1024,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_payload {
            return Err(AveoError::Transport("payload exceeds max_send_payload"));
        }
        if let Some(reply) = (self.responder)(payload) {
            let mut q = self.shared.completions.lock().unwrap();
            q.push_back(reply);
            self.shared.cv.notify_all();
        }
        Ok(())
    }

    fn poll_next_reply(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.shared.completions.lock().unwrap().pop_front())
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut q = self.shared.completions.lock().unwrap();
        loop {
            if let Some(frame) = q.pop_front() {
                return Ok(frame);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AveoError::Timeout);
            }
            let (guard, result) = self.shared.cv.wait_timeout(q, remaining).unwrap();
            q = guard;
            if result.timed_out() && q.is_empty() {
                return Err(AveoError::Timeout);
            }
        }
    }

    fn max_send_payload(&self) -> usize {
        self.max_payload
    }

    /// Clones the responder logic into a fresh, independently-owned
    /// instance with its own completion queue, standing in for a distinct
    /// in-process worker peer.
    fn create_peer(&self, _core: i32, _stacksize: u64) -> Result<(Arc<dyn Transport>, i32)> {
        let id = NEXT_LOOPBACK_PEER.fetch_add(1, Ordering::Relaxed);
        let peer = LoopbackTransport {
            shared: Arc::new(Shared { completions: Mutex::new(VecDeque::new()), cv: Condvar::new() }),
            responder: self.responder.clone(),
            max_payload: self.max_payload,
        };
        Ok((Arc::new(peer), id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_whatever_the_responder_returns() {
        let transport = LoopbackTransport::new(|req| Some(req.to_vec()));
        transport.send(b"ping").unwrap();
        assert_eq!(transport.poll_next_reply().unwrap().unwrap(), b"ping");
    }

    #[test]
    fn recv_timeout_returns_timeout_when_silent() {
        let transport = LoopbackTransport::new(|_| None);
        transport.send(b"noop").unwrap();
        assert!(matches!(transport.recv_timeout(Duration::from_millis(20)), Err(AveoError::Timeout)));
    }

    #[test]
    fn rejects_oversized_payload() {
        let transport = LoopbackTransport::new(|req| Some(req.to_vec())).with_max_payload(4);
        assert!(transport.send(&[0u8; 8]).is_err());
    }
}
