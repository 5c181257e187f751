//! Async fan-out example
//!
//! Issues a large number of asynchronous calls on a single context without
//! waiting on any of them individually, then drains the whole batch with one
//! `context_sync`. Demonstrates that the progress engine keeps exactly one
//! call in flight at a time while the rest queue up, and that peeking a
//! result after `context_sync` never blocks.
//!
//! # Environment Variables
//!
//! - `AVEO_FANOUT_CALLS=<n>` - Number of async calls to issue (default: 10000)

use aveo::ProcHandle;
use aveo_core::{veo_info, env::env_get, AveoError};
use aveo_transport::LoopbackTransport;
use aveo_wire::{CmdCode, Field, Frame};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

fn simulated_worker(call_count: Arc<AtomicU64>) -> Arc<LoopbackTransport> {
    Arc::new(LoopbackTransport::new(move |req| {
        let cmd = CmdCode::from_u8(req[0])?;
        match cmd {
            CmdCode::Ping => Some(Frame::new(CmdCode::Result, vec![Field::U64(0x7f0000)]).encode()),
            CmdCode::Call => {
                let n = call_count.fetch_add(1, Ordering::SeqCst);
                Some(Frame::new(CmdCode::Result, vec![Field::U64(n)]).encode())
            }
            CmdCode::Exit => Some(Frame::new(CmdCode::Ack, vec![]).encode()),
            _ => None,
        }
    }))
}

fn main() -> Result<(), AveoError> {
    println!("=== aveo fan-out example ===\n");

    let num_calls: usize = env_get("AVEO_FANOUT_CALLS", 10_000);
    println!("issuing {num_calls} asynchronous calls\n");

    let call_count = Arc::new(AtomicU64::new(0));
    let transport = simulated_worker(call_count.clone());
    let proc = ProcHandle::from_transport(transport, 0x7f0000);
    let ctx = proc.main_context();

    let start = Instant::now();
    let mut ids = Vec::with_capacity(num_calls);
    for _ in 0..num_calls {
        let args = aveo::args_alloc();
        ids.push(aveo::call_async(&ctx, 0x401000, args)?);
    }
    veo_info!("queued {} requests in {:?}", ids.len(), start.elapsed());

    aveo::context_sync(&ctx)?;
    veo_info!("drained queue in {:?}", start.elapsed());

    let mut ok = 0usize;
    for id in ids {
        if aveo::call_peek_result(&ctx, id).unwrap().is_ok() {
            ok += 1;
        }
    }
    println!("{ok}/{num_calls} calls completed successfully");
    println!("worker processed {} calls total", call_count.load(Ordering::SeqCst));

    aveo::proc_destroy(&proc)?;
    println!("\n=== done ===");
    Ok(())
}
