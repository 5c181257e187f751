//! `ProcHandle`: one accelerator process, its contexts, loaded libraries and
//! symbol cache. Grounded on `ProcHandle.cpp`/`.hpp`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::time::Duration;

use aveo_core::{veo_debug, veo_info, AveoError, Result};
use aveo_transport::{ShmTransport, Transport};
use aveo_wire::{CallArgs, CmdCode, Field, Frame};

use crate::context::Context;

/// Upper bound on the number of contexts (VE cores) a single process may
/// open, matching the original's `MAX_VE_CORES`.
pub const MAX_VE_CORES: usize = 16;
/// Library/symbol names longer than this are rejected before they ever
/// reach the wire.
pub const VEO_SYMNAME_LEN_MAX: usize = 256;

struct SymCache {
    entries: Mutex<HashMap<(u64, String), u64>>,
}

impl SymCache {
    fn new() -> Self {
        SymCache { entries: Mutex::new(HashMap::new()) }
    }

    fn get(&self, libhdl: u64, name: &str) -> Option<u64> {
        self.entries.lock().unwrap().get(&(libhdl, name.to_string())).copied()
    }

    fn insert(&self, libhdl: u64, name: &str, addr: u64) {
        // Only non-zero resolutions are worth remembering; a miss should be
        // retried, not cached as a permanent failure.
        if addr != 0 {
            self.entries.lock().unwrap().insert((libhdl, name.to_string()), addr);
        }
    }
}

/// A single accelerator process: its contexts, loaded libraries, and the
/// symbol cache shared across them.
pub struct ProcHandle {
    transport: Arc<dyn Transport>,
    contexts: Mutex<Vec<Arc<Context>>>,
    sym_cache: SymCache,
    next_core: AtomicUsize,
}

impl ProcHandle {
    /// Creates a process bound to `node`/`core`, forking and exec'ing
    /// `worker_bin`, then performs the boot handshake (a ping call used
    /// purely to learn the worker's initial stack pointer).
    pub fn create(node: i32, core: i32, worker_bin: PathBuf) -> Result<Arc<ProcHandle>> {
        register_cleanup_hook();

        let transport = Arc::new(ShmTransport::spawn(core, &worker_bin, Duration::from_secs(10))?);
        veo_info!("created accelerator process on node {} core {}", node, core);

        let stack_top = boot_ping(transport.clone())?;
        let main_ctx = Context::new(transport.clone(), stack_top);

        let handle = Arc::new(ProcHandle {
            transport,
            contexts: Mutex::new(vec![main_ctx]),
            sym_cache: SymCache::new(),
            next_core: AtomicUsize::new(core as usize + 1),
        });
        PROC_REGISTRY.lock().unwrap().push(Arc::downgrade(&handle));
        Ok(handle)
    }

    /// Wraps an already-connected transport (used by tests and by
    /// `LoopbackTransport`-based examples where there is no real fork/exec).
    pub fn from_transport(transport: Arc<dyn Transport>, stack_top: u64) -> Arc<ProcHandle> {
        register_cleanup_hook();
        let main_ctx = Context::new(transport.clone(), stack_top);
        let handle = Arc::new(ProcHandle {
            transport,
            contexts: Mutex::new(vec![main_ctx]),
            sym_cache: SymCache::new(),
            next_core: AtomicUsize::new(1),
        });
        PROC_REGISTRY.lock().unwrap().push(Arc::downgrade(&handle));
        handle
    }

    pub fn main_context(&self) -> Arc<Context> {
        self.contexts.lock().unwrap()[0].clone()
    }

    pub fn num_contexts(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn get_context(&self, index: usize) -> Option<Arc<Context>> {
        self.contexts.lock().unwrap().get(index).cloned()
    }

    /// Opens a context with the default stack size. See
    /// [`ProcHandle::open_context_with_stacksize`].
    pub fn open_context(&self) -> Result<Arc<Context>> {
        self.open_context_with_stacksize(aveo_core::VEO_DEFAULT_STACKSIZE)
    }

    /// Opens a fresh transport peer (its own shared-memory segment and
    /// worker process, never shared with another context) and constructs a
    /// `Context` bound to it. Grounded on `ProcHandle::ProcHandle`'s
    /// `vh_urpc_peer_create` followed by `new ThreadContext(this, new_up,
    /// ...)`. `stack_size` is clamped to `VEO_STACK_MIN` and carried in the
    /// NEWPEER announcement sent to the main process.
    pub fn open_context_with_stacksize(&self, stack_size: u64) -> Result<Arc<Context>> {
        let core = self.next_core.fetch_add(1, Ordering::SeqCst);
        if core >= MAX_VE_CORES {
            return Err(AveoError::Transport("no free VE cores for a new context"));
        }
        let stack_size = stack_size.max(aveo_core::VEO_STACK_MIN);
        let (peer_transport, segid) = self.transport.create_peer(core as i32, stack_size)?;

        let frame = Frame::new(
            CmdCode::NewPeer,
            vec![Field::I32(segid), Field::I32(core as i32), Field::U64(stack_size)],
        );
        self.main_context().exec_wire_request(frame, Duration::from_secs(10))?;

        let stack_top = boot_ping(peer_transport.clone())?;
        let ctx = Context::new(peer_transport, stack_top);
        self.contexts.lock().unwrap().push(ctx.clone());
        Ok(ctx)
    }

    pub fn del_context(&self, ctx: &Arc<Context>) -> Result<()> {
        ctx.close()?;
        self.contexts.lock().unwrap().retain(|c| !Arc::ptr_eq(c, ctx));
        Ok(())
    }

    /// Every operation below routes through the main context's queue so it
    /// serializes with calls and everything else touching the main
    /// transport, rather than reading and writing the shared transport
    /// directly.
    pub fn load_library(&self, path: &str) -> Result<u64> {
        if path.len() > VEO_SYMNAME_LEN_MAX {
            return Err(AveoError::NameTooLong);
        }
        let frame = Frame::new(CmdCode::LoadLibrary, vec![Field::Bytes(path.as_bytes().to_vec())]);
        let reply = self.main_context().exec_wire_request(frame, Duration::from_secs(20))?;
        first_u64(&reply)
    }

    pub fn unload_library(&self, libhdl: u64) -> Result<()> {
        let frame = Frame::new(CmdCode::UnloadLibrary, vec![Field::U64(libhdl)]);
        self.main_context().exec_wire_request(frame, Duration::from_secs(20))?;
        Ok(())
    }

    pub fn get_sym(&self, libhdl: u64, name: &str) -> Result<u64> {
        if name.len() > VEO_SYMNAME_LEN_MAX {
            return Err(AveoError::NameTooLong);
        }
        if let Some(addr) = self.sym_cache.get(libhdl, name) {
            return Ok(addr);
        }
        let frame = Frame::new(CmdCode::GetSym, vec![Field::U64(libhdl), Field::Bytes(name.as_bytes().to_vec())]);
        let reply = self.main_context().exec_wire_request(frame, Duration::from_secs(20))?;
        let addr = first_u64(&reply)?;
        if addr == 0 {
            return Err(AveoError::NotFound("symbol"));
        }
        self.sym_cache.insert(libhdl, name, addr);
        Ok(addr)
    }

    pub fn alloc_mem(&self, size: u64) -> Result<u64> {
        let frame = Frame::new(CmdCode::Alloc, vec![Field::U64(size)]);
        let reply = self.main_context().exec_wire_request(frame, Duration::from_secs(20))?;
        first_u64(&reply)
    }

    pub fn free_mem(&self, addr: u64) -> Result<()> {
        let frame = Frame::new(CmdCode::Free, vec![Field::U64(addr)]);
        self.main_context().exec_wire_request(frame, Duration::from_secs(20))?;
        Ok(())
    }

    pub fn call_sync_by_name(&self, libhdl: u64, name: &str, args: CallArgs) -> Result<u64> {
        let addr = self.get_sym(libhdl, name)?;
        self.main_context().call_sync(addr, Arc::new(Mutex::new(args)))
    }

    /// Closes every context in order and deregisters. Grounded on
    /// `ProcHandle::exitProc`.
    pub fn exit_proc(&self) -> Result<()> {
        let contexts: Vec<_> = self.contexts.lock().unwrap().drain(..).collect();
        for ctx in contexts {
            let _ = ctx.close();
        }
        Ok(())
    }
}

impl Drop for ProcHandle {
    fn drop(&mut self) {
        let _ = self.exit_proc();
    }
}

fn decode_single_u64(payload: &[u8]) -> Result<u64> {
    if payload.len() < 2 {
        return Err(AveoError::ProtocolViolation("reply shorter than header"));
    }
    let frame = Frame::decode(payload, "L")?;
    first_u64(&frame)
}

fn first_u64(frame: &Frame) -> Result<u64> {
    frame.fields.first().ok_or(AveoError::ProtocolViolation("missing value"))?.as_u64()
}

/// Sends the boot-time ping call whose only purpose is to learn the
/// worker's initial stack pointer, per `ProcHandle::ProcHandle`.
fn boot_ping(transport: Arc<dyn Transport>) -> Result<u64> {
    let frame = Frame::new(CmdCode::Ping, vec![]);
    transport.send(&frame.encode())?;
    let reply = transport.recv_timeout(Duration::from_secs(10))?;
    decode_single_u64(&reply)
}

static PROC_REGISTRY: Mutex<Vec<Weak<ProcHandle>>> = Mutex::new(Vec::new());
static CLEANUP_HOOK_REGISTERED: Once = Once::new();

/// Registers a process-exit hook that tears down every still-alive
/// `ProcHandle`, the Rust analogue of the original's
/// `__attribute__((destructor))` cleanup. Installed once, the first time a
/// `ProcHandle` is created.
fn register_cleanup_hook() {
    CLEANUP_HOOK_REGISTERED.call_once(|| unsafe {
        libc::atexit(cleanup_all_procs);
    });
}

extern "C" fn cleanup_all_procs() {
    let procs: Vec<_> = PROC_REGISTRY.lock().unwrap().drain(..).collect();
    for weak in procs {
        if let Some(handle) = weak.upgrade() {
            veo_debug!("cleaning up accelerator process at exit");
            let _ = handle.exit_proc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aveo_transport::LoopbackTransport;

    fn ping_transport() -> Arc<dyn Transport> {
        Arc::new(LoopbackTransport::new(|req| {
            let cmd = CmdCode::from_u8(req[0])?;
            match cmd {
                CmdCode::Ping => Some(Frame::new(CmdCode::Result, vec![Field::U64(0x7000)]).encode()),
                CmdCode::LoadLibrary => Some(Frame::new(CmdCode::Result, vec![Field::U64(99)]).encode()),
                CmdCode::GetSym => Some(Frame::new(CmdCode::Result, vec![Field::U64(0x1234)]).encode()),
                CmdCode::Exit => Some(Frame::new(CmdCode::Ack, vec![]).encode()),
                _ => None,
            }
        }))
    }

    #[test]
    fn from_transport_sets_up_a_main_context() {
        let proc = ProcHandle::from_transport(ping_transport(), 0x7000);
        assert_eq!(proc.num_contexts(), 1);
    }

    #[test]
    fn get_sym_caches_after_first_lookup() {
        let calls = Arc::new(Mutex::new(0usize));
        let calls2 = calls.clone();
        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new(move |req| {
            let cmd = CmdCode::from_u8(req[0])?;
            if cmd == CmdCode::GetSym {
                *calls2.lock().unwrap() += 1;
            }
            match cmd {
                CmdCode::GetSym => Some(Frame::new(CmdCode::Result, vec![Field::U64(0xdead)]).encode()),
                _ => None,
            }
        }));
        let proc = ProcHandle::from_transport(transport, 0x7000);
        assert_eq!(proc.get_sym(1, "foo").unwrap(), 0xdead);
        assert_eq!(proc.get_sym(1, "foo").unwrap(), 0xdead);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn exit_proc_closes_every_context() {
        let proc = ProcHandle::from_transport(ping_transport(), 0x7000);
        let ctx = proc.main_context();
        proc.exit_proc().unwrap();
        assert_eq!(ctx.state(), aveo_core::ContextState::Exit);
    }
}
