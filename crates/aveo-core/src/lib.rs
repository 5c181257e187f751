//! Shared ids, error types, environment helpers and logging macros used by
//! every other `aveo-*` crate.

pub mod env;
pub mod error;
pub mod ids;
pub mod kprint;
pub mod limits;

pub use error::{AveoError, Result};
pub use ids::{CommandStatus, ContextState, QueueState, RequestId, RequestIdGen};
pub use limits::{VEO_DEFAULT_STACKSIZE, VEO_STACK_MIN};
