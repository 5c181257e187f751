//! Wire frame format and `CallArgs` stack-image marshalling, shared between
//! the transport and runtime layers.

pub mod call_args;
pub mod cmd;
pub mod frame;

pub use call_args::{BuiltCallArgs, CallArgs, Direction, MAX_NUM_ARGS, NUM_ARGS_ON_REGISTER, PARAM_AREA_OFFSET};
pub use cmd::CmdCode;
pub use frame::{Field, Frame};
