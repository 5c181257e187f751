//! The progress engine: `Command`, `CommQueue`, `Context` and `ProcHandle`.

pub mod comm_queue;
pub mod command;
pub mod context;
pub mod proc_handle;
pub mod queue;

pub use comm_queue::CommQueue;
pub use command::Command;
pub use context::{Context, PART_SENDFRAG_DEFAULT, REPLY_TIMEOUT, SYNC_TIMEOUT};
pub use proc_handle::{ProcHandle, MAX_VE_CORES, VEO_SYMNAME_LEN_MAX};
pub use queue::{BlockingMap, BlockingQueue};
