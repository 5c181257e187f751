//! The `Transport` trait plus its two implementations: `ShmTransport` for a
//! real worker process and `LoopbackTransport` for tests.

pub mod loopback;
pub mod ring;
pub mod shm;
pub mod transport;

pub use loopback::LoopbackTransport;
pub use ring::ByteRing;
pub use shm::{ShmTransport, DEFAULT_RING_CAPACITY};
pub use transport::Transport;
