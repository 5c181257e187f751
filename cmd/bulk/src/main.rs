//! Large-argument call and bulk memory transfer example
//!
//! Two scenarios against a tiny simulated worker:
//!
//! 1. A call whose argument stack image is too large for a single frame,
//!    forcing the composite large-argument path (`CALL_STKIN`).
//! 2. A direct bulk `write_mem`/`read_mem` round trip, fragmented according
//!    to `VEO_SENDFRAG`/`VEO_RECVFRAG`.

use aveo::ProcHandle;
use aveo_core::{veo_info, AveoError};
use aveo_transport::LoopbackTransport;
use aveo_wire::{CmdCode, Direction, Field, Frame};
use std::sync::Arc;

const SMALL_PAYLOAD_CAP: usize = 512;

fn simulated_worker() -> Arc<LoopbackTransport> {
    Arc::new(
        LoopbackTransport::new(|req| {
            let cmd = CmdCode::from_u8(req[0])?;
            match cmd {
                CmdCode::Ping => Some(Frame::new(CmdCode::Result, vec![Field::U64(0x7f0000)]).encode()),
                CmdCode::Call | CmdCode::CallStackIn | CmdCode::CallStackOut | CmdCode::CallStackInOut => {
                    Some(Frame::new(CmdCode::Result, vec![Field::U64(1)]).encode())
                }
                CmdCode::SendBuff => Some(Frame::new(CmdCode::SendBuff, vec![Field::U64(0)]).encode()),
                CmdCode::RecvBuff => {
                    let frame = Frame::decode(req, "LQ").ok()?;
                    let size = frame.fields.get(1)?.as_size().ok()? as usize;
                    // simulated worker memory: every byte is 0xAB
                    Some(Frame::new(CmdCode::RecvBuff, vec![Field::Bytes(vec![0xABu8; size])]).encode())
                }
                CmdCode::Exit => Some(Frame::new(CmdCode::Ack, vec![]).encode()),
                _ => None,
            }
        })
        // force the composite large-argument path for anything beyond a
        // tiny frame, so the demo doesn't need a multi-megabyte buffer
        .with_max_payload(SMALL_PAYLOAD_CAP),
    )
}

fn main() -> Result<(), AveoError> {
    println!("=== aveo large-argument and bulk transfer example ===\n");

    let proc = ProcHandle::from_transport(simulated_worker(), 0x7f0000);
    let ctx = proc.main_context();

    println!("-- large-argument call --");
    let big_payload = vec![0x42u8; SMALL_PAYLOAD_CAP * 4];
    let args = aveo::args_alloc();
    aveo::args_set_stack_buffer(&args, big_payload.clone(), big_payload.len(), Direction::In)?;
    let rv = aveo::call_sync(&ctx, 0x401000, args)?;
    veo_info!("large-argument call returned {}", rv);
    println!("call with a {}-byte stack buffer returned {}", big_payload.len(), rv);

    println!("\n-- bulk memory round trip --");
    let size = 300 * 1024;
    let data = vec![0x11u8; size];
    aveo::write_mem(&ctx, 0x600000, data)?;
    println!("wrote {size} bytes to the accelerator");

    let readback = aveo::read_mem(&ctx, 0x700000, size)?;
    println!("read back {} bytes, first byte = 0x{:02x}", readback.len(), readback[0]);
    assert_eq!(readback.len(), size);

    aveo::proc_destroy(&proc)?;
    println!("\n=== done ===");
    Ok(())
}
