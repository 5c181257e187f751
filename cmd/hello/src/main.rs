//! Hello-world offload example
//!
//! Opens an accelerator process, loads a (simulated) kernel library, resolves
//! a symbol, and issues a single synchronous call.
//!
//! This example stands in a real worker process with an in-process
//! responder bound through `LoopbackTransport`, since driving an actual VE
//! core is out of scope here. Swap `simulated_worker()` for
//! `aveo::proc_create(...)` to talk to a real `veorun`-style binary.

use aveo::{ContextAttr, ProcHandle};
use aveo_core::{veo_info, AveoError};
use aveo_transport::LoopbackTransport;
use aveo_wire::{CmdCode, Field, Frame};
use std::sync::Arc;

fn simulated_worker() -> Arc<LoopbackTransport> {
    Arc::new(LoopbackTransport::new(|req| {
        let cmd = CmdCode::from_u8(req[0])?;
        match cmd {
            CmdCode::Ping => Some(Frame::new(CmdCode::Result, vec![Field::U64(0x7f0000)]).encode()),
            CmdCode::LoadLibrary => Some(Frame::new(CmdCode::Result, vec![Field::U64(1)]).encode()),
            CmdCode::GetSym => Some(Frame::new(CmdCode::Result, vec![Field::U64(0x401000)]).encode()),
            CmdCode::Call => {
                // pretend the kernel computed 6 * 7
                Some(Frame::new(CmdCode::Result, vec![Field::U64(42)]).encode())
            }
            CmdCode::Exit => Some(Frame::new(CmdCode::Ack, vec![]).encode()),
            _ => None,
        }
    }))
}

fn main() -> Result<(), AveoError> {
    println!("=== aveo hello example ===\n");

    let transport = simulated_worker();
    let proc = ProcHandle::from_transport(transport, 0x7f0000);
    veo_info!("process created, {} context(s) open", proc.num_contexts());

    let ctx = aveo::context_open_with_attr(&proc, ContextAttr::new())?;

    let libhdl = proc.load_library("libkernel.so")?;
    println!("loaded library, handle={libhdl}");

    let args = aveo::args_alloc();
    aveo::args_set_i64(&args, 6)?;
    aveo::args_set_i64(&args, 7)?;

    let addr = proc.get_sym(libhdl, "multiply")?;
    let rv = aveo::call_sync(&ctx, addr, args)?;
    println!("multiply(6, 7) = {rv}");

    aveo::context_close(&ctx)?;
    aveo::proc_destroy(&proc)?;
    println!("\n=== done ===");
    Ok(())
}
