//! # aveo — host-side accelerator offload runtime
//!
//! A small, VEO-style runtime for driving a tightly-coupled accelerator
//! process from the host: create a process, open one or more execution
//! contexts on it, load libraries, resolve symbols, and issue synchronous
//! or asynchronous calls with marshalled stack arguments.
//!
//! ## Quick start
//!
//! ```no_run
//! use aveo::{ContextAttr, ProcHandle};
//! use aveo_wire::CallArgs;
//! use std::path::PathBuf;
//!
//! # fn run() -> aveo_core::Result<()> {
//! let proc = ProcHandle::create(0, 0, PathBuf::from("veorun"))?;
//! let ctx = proc.main_context();
//!
//! let libhdl = proc.load_library("./libkernel.so")?;
//! let rv = proc.call_sync_by_name(libhdl, "do_work", CallArgs::new())?;
//! println!("worker returned {rv}");
//!
//! ctx.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! aveo (this crate)      public operation surface
//!    |
//! aveo-runtime           Context progress engine, ProcHandle, CommQueue
//!    |
//! aveo-transport         Transport trait: ShmTransport / LoopbackTransport
//!    |
//! aveo-wire              wire frames, CallArgs stack-image marshalling
//!    |
//! aveo-core              ids, errors, env helpers, logging macros
//! ```

pub use aveo_core::{AveoError, CommandStatus, ContextState, RequestId, Result, VEO_DEFAULT_STACKSIZE, VEO_STACK_MIN};
pub use aveo_runtime::{CommQueue, Context, ProcHandle};
pub use aveo_transport::{LoopbackTransport, ShmTransport, Transport};
pub use aveo_wire::{BuiltCallArgs, CallArgs, CmdCode, Direction};

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Configuration for a newly opened [`Context`], mirroring
/// `ThreadContextAttr`.
#[derive(Debug, Clone, Copy)]
pub struct ContextAttr {
    stack_size: u64,
}

impl ContextAttr {
    pub fn new() -> Self {
        ContextAttr { stack_size: VEO_DEFAULT_STACKSIZE }
    }

    /// Clamps to [`VEO_STACK_MIN`] rather than rejecting a too-small value,
    /// matching `ThreadContextAttr::setStacksize`.
    pub fn with_stack_size(mut self, size: u64) -> Self {
        self.stack_size = size.max(VEO_STACK_MIN);
        self
    }

    pub fn stack_size(&self) -> u64 {
        self.stack_size
    }
}

impl Default for ContextAttr {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates an accelerator process on `node`, launching the default worker
/// binary (`VEORUN_BIN`, or `worker_bin` if given).
pub fn proc_create(node: i32, worker_bin: Option<PathBuf>) -> Result<Arc<ProcHandle>> {
    let core: i32 = aveo_core::env::env_get("VE_CORE_NUMBER", 0);
    let bin = worker_bin
        .or_else(|| aveo_core::env::env_get_str("VEORUN_BIN").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("veorun"));
    ProcHandle::create(node, core, bin)
}

/// Creates an accelerator process bound to a specific static executable
/// rather than the default dynamic `veorun` loader.
pub fn proc_create_static(node: i32, exe: PathBuf) -> Result<Arc<ProcHandle>> {
    let core: i32 = aveo_core::env::env_get("VE_CORE_NUMBER", 0);
    ProcHandle::create(node, core, exe)
}

pub fn proc_destroy(proc: &ProcHandle) -> Result<()> {
    proc.exit_proc()
}

pub fn context_open(proc: &ProcHandle) -> Result<Arc<Context>> {
    proc.open_context()
}

/// Opens a context with `attr`'s stack size, which is carried through to the
/// worker's NEWPEER registration for the new peer.
pub fn context_open_with_attr(proc: &ProcHandle, attr: ContextAttr) -> Result<Arc<Context>> {
    proc.open_context_with_stacksize(attr.stack_size())
}

pub fn context_close(ctx: &Context) -> Result<()> {
    ctx.close()
}

pub fn get_context_state(ctx: &Context) -> ContextState {
    ctx.state()
}

pub fn context_sync(ctx: &Context) -> Result<()> {
    ctx.synchronize()
}

// ---- call argument helpers ---------------------------------------------

pub fn args_alloc() -> Arc<Mutex<CallArgs>> {
    Arc::new(Mutex::new(CallArgs::new()))
}

pub fn args_clear(args: &Arc<Mutex<CallArgs>>) {
    *args.lock().unwrap() = CallArgs::new();
}

/// Releases an argument-list handle. `args_clear` reuses the allocation for
/// a new set of arguments; this gives the handle up entirely, matching
/// `veo_args_free`'s distinct identity even though `Drop` would reclaim it
/// anyway once every other `Arc` clone is gone.
pub fn args_free(args: Arc<Mutex<CallArgs>>) {
    drop(args);
}

pub fn args_set_i64(args: &Arc<Mutex<CallArgs>>, v: i64) -> Result<usize> {
    args.lock().unwrap().push_i64(v)
}

pub fn args_set_u64(args: &Arc<Mutex<CallArgs>>, v: u64) -> Result<usize> {
    args.lock().unwrap().push_u64(v)
}

pub fn args_set_int8(args: &Arc<Mutex<CallArgs>>, v: i8) -> Result<usize> {
    args.lock().unwrap().push_int8(v)
}

pub fn args_set_int16(args: &Arc<Mutex<CallArgs>>, v: i16) -> Result<usize> {
    args.lock().unwrap().push_int16(v)
}

pub fn args_set_int32(args: &Arc<Mutex<CallArgs>>, v: i32) -> Result<usize> {
    args.lock().unwrap().push_int32(v)
}

pub fn args_set_int64(args: &Arc<Mutex<CallArgs>>, v: i64) -> Result<usize> {
    args.lock().unwrap().push_int64(v)
}

pub fn args_set_uint8(args: &Arc<Mutex<CallArgs>>, v: u8) -> Result<usize> {
    args.lock().unwrap().push_uint8(v)
}

pub fn args_set_uint16(args: &Arc<Mutex<CallArgs>>, v: u16) -> Result<usize> {
    args.lock().unwrap().push_uint16(v)
}

pub fn args_set_uint32(args: &Arc<Mutex<CallArgs>>, v: u32) -> Result<usize> {
    args.lock().unwrap().push_uint32(v)
}

pub fn args_set_uint64(args: &Arc<Mutex<CallArgs>>, v: u64) -> Result<usize> {
    args.lock().unwrap().push_uint64(v)
}

pub fn args_set_f32(args: &Arc<Mutex<CallArgs>>, v: f32) -> Result<usize> {
    args.lock().unwrap().push_f32(v)
}

pub fn args_set_f64(args: &Arc<Mutex<CallArgs>>, v: f64) -> Result<usize> {
    args.lock().unwrap().push_f64(v)
}

pub fn args_set_stack_buffer(
    args: &Arc<Mutex<CallArgs>>,
    data: Vec<u8>,
    max_len: usize,
    direction: Direction,
) -> Result<usize> {
    args.lock().unwrap().push_stack_buffer(data, max_len, direction)
}

pub fn args_get_stack_buffer(args: &Arc<Mutex<CallArgs>>, index: usize) -> Result<Vec<u8>> {
    args.lock().unwrap().stack_buffer(index).map(|b| b.to_vec())
}

// ---- calls --------------------------------------------------------------

pub fn call_sync(ctx: &Context, func_addr: u64, args: Arc<Mutex<CallArgs>>) -> Result<u64> {
    ctx.call_sync(func_addr, args)
}

pub fn call_async(ctx: &Context, func_addr: u64, args: Arc<Mutex<CallArgs>>) -> Result<RequestId> {
    ctx.call_async(func_addr, args)
}

pub fn call_async_by_name(
    proc: &ProcHandle,
    ctx: &Context,
    libhdl: u64,
    name: &str,
    args: Arc<Mutex<CallArgs>>,
) -> Result<RequestId> {
    let addr = proc.get_sym(libhdl, name)?;
    ctx.call_async(addr, args)
}

pub fn call_async_vh(ctx: &Context, func: impl FnOnce() -> u64 + Send + 'static) -> Result<RequestId> {
    ctx.call_vh_async(func)
}

pub fn call_peek_result(ctx: &Context, id: RequestId) -> Option<Result<u64>> {
    ctx.call_peek_result(id)
}

pub fn call_wait_result(ctx: &Context, id: RequestId, timeout: Duration) -> Result<u64> {
    ctx.call_wait_result(id, timeout)
}

// ---- memory ---------------------------------------------------------------

pub fn alloc_mem(proc: &ProcHandle, size: u64) -> Result<u64> {
    proc.alloc_mem(size)
}

pub fn free_mem(proc: &ProcHandle, addr: u64) -> Result<()> {
    proc.free_mem(addr)
}

pub fn read_mem(ctx: &Context, vemva: u64, size: usize) -> Result<Vec<u8>> {
    ctx.read_mem(vemva, size, aveo_runtime::SYNC_TIMEOUT)
}

pub fn write_mem(ctx: &Context, vemva: u64, data: Vec<u8>) -> Result<()> {
    ctx.write_mem(vemva, data, aveo_runtime::SYNC_TIMEOUT)
}

/// Converts any [`AveoError`] into the `0`/negative-errno ABI surface
/// callers of a C-style binding would expect.
pub fn to_errno(result: &Result<u64>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.to_errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_attr_clamps_small_stack_sizes() {
        let attr = ContextAttr::new().with_stack_size(1024);
        assert_eq!(attr.stack_size(), VEO_STACK_MIN);
    }

    #[test]
    fn context_attr_keeps_larger_stack_sizes() {
        let attr = ContextAttr::new().with_stack_size(256 * 1024 * 1024);
        assert_eq!(attr.stack_size(), 256 * 1024 * 1024);
    }

    #[test]
    fn args_helpers_push_in_order() {
        let args = args_alloc();
        args_set_i64(&args, 1).unwrap();
        args_set_u64(&args, 2).unwrap();
        assert_eq!(args.lock().unwrap().num_args(), 2);
        args_clear(&args);
        assert_eq!(args.lock().unwrap().num_args(), 0);
    }

    #[test]
    fn args_helpers_cover_every_integer_width() {
        let args = args_alloc();
        args_set_int8(&args, -1).unwrap();
        args_set_int16(&args, -1).unwrap();
        args_set_int32(&args, -1).unwrap();
        args_set_int64(&args, -1).unwrap();
        args_set_uint8(&args, 1).unwrap();
        args_set_uint16(&args, 1).unwrap();
        args_set_uint32(&args, 1).unwrap();
        args_set_uint64(&args, 1).unwrap();
        assert_eq!(args.lock().unwrap().num_args(), 8);
        args_free(args);
    }
}
