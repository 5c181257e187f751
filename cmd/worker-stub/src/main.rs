//! Worker-side stub
//!
//! `ShmTransport::spawn` execs a binary as `<path> <shm-name> <core>` and
//! waits for it to attach to the shared memory region it created. A real
//! worker would map that region, flip the attach flag, and run the
//! accelerator-side command loop (decode frames, dispatch calls, marshal
//! replies) — that loop lives on the accelerator and is out of scope here.
//!
//! This stub only validates the argv contract and exits, so it's useful for
//! exercising `ShmTransport::spawn`'s fork/exec/attach-timeout path without a
//! real accelerator attached.

use aveo_core::veo_info;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: {} <shm-name> <core>", args.first().map(String::as_str).unwrap_or("worker-stub"));
        std::process::exit(2);
    }
    aveo_core::kprint::init();
    veo_info!("worker-stub invoked for shm={} core={}", args[1], args[2]);
    eprintln!("worker-stub: no accelerator-side command loop implemented, exiting");
}
