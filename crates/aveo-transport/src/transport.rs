//! The `Transport` seam: everything `aveo-runtime` needs from whatever
//! carries frames to and from a worker process.

use std::sync::Arc;
use std::time::Duration;

use aveo_core::Result;

/// A byte-oriented, single-peer duplex channel. Implementations own
/// correlation of replies to requests at the ring level only (slot
/// bookkeeping); request/reply matching by id is the runtime's job.
pub trait Transport: Send + Sync {
    /// Enqueues an already-encoded frame for the worker. Non-blocking: if
    /// the ring is full this returns `Err` rather than stalling the caller.
    fn send(&self, payload: &[u8]) -> Result<()>;

    /// Non-blocking check for a reply frame. `Ok(None)` means nothing is
    /// ready yet.
    fn poll_next_reply(&self) -> Result<Option<Vec<u8>>>;

    /// Blocks up to `timeout` for a single reply frame.
    fn recv_timeout(&self, timeout: Duration) -> Result<Vec<u8>>;

    /// Releases whatever ring resource backed the most recently consumed
    /// reply. A no-op for transports that don't need explicit slot release.
    fn mark_slot_done(&self) {}

    /// Largest payload this transport can carry in a single frame without
    /// fragmentation.
    fn max_send_payload(&self) -> usize;

    /// Opens an independent peer bound to `core`, requesting `stacksize`
    /// bytes of accelerator stack. Every `Context` owns its transport
    /// exclusively, so opening a new one always means a new peer rather
    /// than a second handle onto this one. Returns the new transport and a
    /// synthetic peer id (a pid for `ShmTransport`, a sequence number for
    /// `LoopbackTransport`) to carry as NEWPEER's `segid` field.
    fn create_peer(&self, core: i32, stacksize: u64) -> Result<(Arc<dyn Transport>, i32)>;
}
