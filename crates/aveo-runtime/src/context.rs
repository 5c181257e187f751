//! `Context`: the progress engine and its public call/memory operations.
//! Grounded on `Context.cpp`/`.hpp`, with the progress lock redesigned per
//! `SPEC_FULL.md` §4.4/§9 to use a plain, non-reentrant `Mutex` instead of
//! the original's `std::recursive_mutex`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use aveo_core::{veo_debug, veo_warn, AveoError, ContextState, RequestId, RequestIdGen, Result};
use aveo_transport::Transport;
use aveo_wire::{BuiltCallArgs, CallArgs, CmdCode, Field, Frame};

use crate::command::Command;
use crate::comm_queue::CommQueue;

/// Default reply timeout for a single asynchronous request.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(20);
/// Synchronous calls wait 15x longer than a single async reply, matching
/// the original's `REPLY_TIMEOUT * 15`.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(20 * 15);
/// Default fragment size for asynchronous bulk memory transfer.
pub const PART_SENDFRAG_DEFAULT: usize = 4 * 1024 * 1024;

pub struct Context {
    transport: Arc<dyn Transport>,
    queue: CommQueue,
    ids: RequestIdGen,
    state: Mutex<ContextState>,
    progress_lock: Mutex<()>,
    outstanding: Mutex<HashSet<RequestId>>,
    /// The accelerator-side stack pointer fetched during the boot handshake.
    stack_top: u64,
    send_frag: usize,
    recv_frag: usize,
    /// Lets a command's submit closure (running outside `progress_lock`,
    /// e.g. a composite large call) call back into this same context's
    /// queue instead of bypassing onto a separate transport handle.
    self_weak: Weak<Context>,
}

impl Context {
    pub fn new(transport: Arc<dyn Transport>, stack_top: u64) -> Arc<Self> {
        let send_frag = aveo_core::env::env_get("VEO_SENDFRAG", PART_SENDFRAG_DEFAULT);
        let recv_frag = aveo_core::env::env_get("VEO_RECVFRAG", PART_SENDFRAG_DEFAULT);
        Arc::new_cyclic(|weak| Context {
            transport,
            queue: CommQueue::new(),
            ids: RequestIdGen::new(),
            state: Mutex::new(ContextState::Running),
            progress_lock: Mutex::new(()),
            outstanding: Mutex::new(HashSet::new()),
            stack_top,
            send_frag,
            recv_frag,
            self_weak: weak.clone(),
        })
    }

    pub fn state(&self) -> ContextState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ContextState) {
        *self.state.lock().unwrap() = state;
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state().is_terminal() {
            Err(AveoError::AlreadyExited)
        } else {
            Ok(())
        }
    }

    // ---- progress engine --------------------------------------------

    /// Drains at most `max_ops` submit/complete steps (0 = until no more
    /// progress can be made in one pass). Returns the number of steps taken.
    pub fn progress(&self, max_ops: usize) -> Result<usize> {
        let mut done = 0usize;
        loop {
            if max_ops != 0 && done >= max_ops {
                break;
            }
            if !self.progress_once()? {
                break;
            }
            done += 1;
        }
        Ok(done)
    }

    fn progress_once(&self) -> Result<bool> {
        if self.try_complete_inflight()? {
            return Ok(true);
        }
        self.try_submit_next()
    }

    /// Safe to run under `progress_lock`: completion closures never
    /// recurse into `progress`.
    fn try_complete_inflight(&self) -> Result<bool> {
        let _guard = self.progress_lock.lock().unwrap();
        if self.queue.inflight_is_empty() {
            return Ok(false);
        }
        match self.transport.poll_next_reply()? {
            None => Ok(false),
            Some(payload) => {
                let cmd = self.queue.take_inflight().expect("checked non-empty under the lock");
                let (id, result) = cmd.complete(&payload);
                self.queue.push_completion(id, result);
                self.transport.mark_slot_done();
                Ok(true)
            }
        }
    }

    /// Pops the next request and, for host-only commands, runs its submit
    /// closure *outside* `progress_lock` — that closure may itself call
    /// `progress` (e.g. a composite memory transfer waiting on its
    /// fragments), which would deadlock on a reentrant acquire of the same
    /// lock otherwise.
    fn try_submit_next(&self) -> Result<bool> {
        let popped = {
            let _guard = self.progress_lock.lock().unwrap();
            if !self.queue.inflight_is_empty() {
                return Ok(false);
            }
            self.queue.try_pop_request()
        };
        let mut cmd = match popped {
            Some(cmd) => cmd,
            None => return Ok(false),
        };

        if cmd.is_host_only() {
            if !self.queue.inflight_is_empty() {
                // Another command filled the slot between the unlock above
                // and here; preserve single-in-flight-slot ordering.
                self.queue.push_request_front(cmd)?;
                return Ok(false);
            }
            let submit_result = cmd.submit();
            let (id, complete_result) = cmd.complete(&[]);
            let result = submit_result.and(Ok(())).and(complete_result);
            self.queue.push_completion(id, result);
            Ok(true)
        } else {
            match cmd.submit() {
                Ok(()) => {
                    let _guard = self.progress_lock.lock().unwrap();
                    self.queue.set_inflight(cmd);
                    Ok(true)
                }
                // A full send ring is transient: put the command back at
                // the front of the queue and retry on the next pass rather
                // than failing the caller's request.
                Err(AveoError::Transport("ring full")) => {
                    self.queue.push_request_front(cmd)?;
                    Ok(false)
                }
                Err(e) => {
                    let (id, _) = cmd.complete(&[]);
                    self.queue.push_completion(id, Err(e));
                    Ok(true)
                }
            }
        }
    }

    pub fn synchronize(&self) -> Result<()> {
        loop {
            let made_progress = self.progress_once()?;
            if self.queue.is_idle() {
                return Ok(());
            }
            if !made_progress {
                std::thread::sleep(Duration::from_micros(100));
            }
        }
    }

    pub fn close(&self) -> Result<()> {
        if self.state().is_terminal() {
            return Ok(());
        }
        self.synchronize()?;
        let frame = Frame::new(CmdCode::Exit, vec![]);
        let _ = self.transport.send(&frame.encode());
        let _ = self.transport.recv_timeout(REPLY_TIMEOUT);
        self.set_state(ContextState::Exit);
        self.queue.close_requests();
        self.queue.cancel_all();
        self.outstanding.lock().unwrap().clear();
        Ok(())
    }

    // ---- calls ---------------------------------------------------------

    /// `args` is shared with the caller: stack-buffer `Out`/`InOut`
    /// arguments are written back into it once the call completes, the same
    /// by-reference relationship the original keeps between `Context` and
    /// the caller-owned `CallArgs`.
    pub fn call_async(&self, func_addr: u64, args: Arc<Mutex<CallArgs>>) -> Result<RequestId> {
        self.ensure_running()?;
        let id = self.ids.issue();
        self.outstanding.lock().unwrap().insert(id);

        let max_payload = self.transport.max_send_payload();
        let built = args.lock().unwrap().build(self.stack_top)?;

        if built.stack_image.len() > max_payload {
            self.submit_composite_large_call(id, func_addr, args, built)?;
        } else {
            self.submit_simple_call(id, func_addr, args, built)?;
        }
        Ok(id)
    }

    fn submit_simple_call(&self, id: RequestId, func_addr: u64, args: Arc<Mutex<CallArgs>>, built: BuiltCallArgs) -> Result<()> {
        let transport = self.transport.clone();
        let frame = build_call_frame(func_addr, &built);
        let mut sent = false;
        let submit = move || -> Result<()> {
            if !sent {
                transport.send(&frame.encode())?;
                sent = true;
            }
            Ok(())
        };
        let complete = move |payload: &[u8]| -> Result<u64> {
            let reply = decode_reply(payload)?;
            unpack_call_result(&reply, &built, &mut args.lock().unwrap())
        };
        let cmd = Command::new(id, false, submit, complete);
        self.queue.push_request(cmd)
    }

    /// Composite host-only call for arguments too large for a single
    /// frame: write the overflow stack region separately, issue a plain
    /// call, then read the output region back. Grounded on
    /// `Context::doCallAsync`'s large-argument path. The submit closure
    /// calls back into `self` (via a `Weak` upgrade, since it runs outside
    /// `progress_lock`) through `exec_wire_request` rather than bypassing
    /// onto a second, unsynchronized handle to the same transport — there
    /// is still exactly one reader of this context's completion ring.
    fn submit_composite_large_call(
        &self,
        id: RequestId,
        func_addr: u64,
        args: Arc<Mutex<CallArgs>>,
        built: BuiltCallArgs,
    ) -> Result<()> {
        let self_weak = self.self_weak.clone();

        let submit = move || -> Result<()> {
            let ctx = self_weak.upgrade().ok_or(AveoError::ProtocolViolation("context dropped mid-call"))?;

            if built.copied_in {
                let write_id = ctx.async_write_mem(ctx.stack_top, built.stack_image.clone())?;
                ctx.call_wait_result(write_id, SYNC_TIMEOUT)?;
            }

            let frame = build_call_frame(func_addr, &built);
            let reply = ctx.exec_wire_request(frame, SYNC_TIMEOUT)?;
            let rv = unpack_call_result(&reply, &built, &mut args.lock().unwrap())?;

            LAST_COMPOSITE_RESULT.with(|cell| *cell.borrow_mut() = Some(rv));
            Ok(())
        };
        let complete = move |_payload: &[u8]| -> Result<u64> {
            LAST_COMPOSITE_RESULT.with(|cell| cell.borrow_mut().take()).ok_or(AveoError::ProtocolViolation("composite call produced no result"))
        };
        let cmd = Command::new(id, true, submit, complete);
        self.queue.push_request(cmd)
    }

    /// Submits `frame` as a single non-host-only command through this
    /// context's own queue and blocks for the decoded reply. Used wherever
    /// a request/reply round trip must serialize with everything else
    /// touching this context's transport: library/symbol/memory operations,
    /// peer registration, and the wire step of a composite call.
    pub(crate) fn exec_wire_request(&self, frame: Frame, timeout: Duration) -> Result<Frame> {
        self.ensure_running()?;
        let id = self.ids.issue();
        self.outstanding.lock().unwrap().insert(id);

        let transport = self.transport.clone();
        let mut sent = false;
        let reply_slot: Arc<Mutex<Option<Frame>>> = Arc::new(Mutex::new(None));
        let reply_slot2 = reply_slot.clone();

        let submit = move || -> Result<()> {
            if !sent {
                transport.send(&frame.encode())?;
                sent = true;
            }
            Ok(())
        };
        let complete = move |payload: &[u8]| -> Result<u64> {
            let reply = decode_reply(payload)?;
            *reply_slot2.lock().unwrap() = Some(reply);
            Ok(0)
        };
        let cmd = Command::new(id, false, submit, complete);
        self.queue.push_request(cmd)?;
        self.call_wait_result(id, timeout)?;
        reply_slot.lock().unwrap().take().ok_or(AveoError::ProtocolViolation("exec_wire_request produced no reply"))
    }

    pub fn call_peek_result(&self, id: RequestId) -> Option<Result<u64>> {
        let result = self.queue.peek_completion(&id);
        if result.is_some() {
            self.outstanding.lock().unwrap().remove(&id);
        }
        result
    }

    pub fn call_wait_result(&self, id: RequestId, timeout: Duration) -> Result<u64> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(result) = self.call_peek_result(id) {
                return result;
            }
            self.progress(1)?;
            if std::time::Instant::now() >= deadline {
                return Err(AveoError::Timeout);
            }
        }
    }

    pub fn call_sync(&self, func_addr: u64, args: Arc<Mutex<CallArgs>>) -> Result<u64> {
        self.ensure_running()?;
        self.synchronize()?;
        let id = self.call_async(func_addr, args)?;
        match self.call_wait_result(id, SYNC_TIMEOUT) {
            Ok(v) => Ok(v),
            Err(AveoError::Timeout) => {
                veo_warn!("callSync timed out; tearing context down");
                self.set_state(ContextState::Exit);
                self.queue.close_requests();
                self.queue.cancel_all();
                Err(AveoError::Timeout)
            }
            Err(e) => Err(e),
        }
    }

    pub fn call_vh_async(&self, func: impl FnOnce() -> u64 + Send + 'static) -> Result<RequestId> {
        self.ensure_running()?;
        let id = self.ids.issue();
        self.outstanding.lock().unwrap().insert(id);
        let func = Mutex::new(Some(func));
        let result_cell: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let result_cell2 = result_cell.clone();
        let submit = move || -> Result<()> {
            let f = func.lock().unwrap().take().expect("call_vh_async submit invoked twice");
            *result_cell2.lock().unwrap() = Some(f());
            Ok(())
        };
        let complete = move |_payload: &[u8]| -> Result<u64> {
            result_cell.lock().unwrap().take().ok_or(AveoError::ProtocolViolation("host call produced no result"))
        };
        let cmd = Command::new(id, true, submit, complete);
        self.queue.push_request(cmd)?;
        Ok(id)
    }

    // ---- bulk memory transfer ------------------------------------------

    pub fn async_read_mem(&self, vemva: u64, size: usize) -> Result<RequestId> {
        self.async_bulk_transfer(vemva, size, None, BulkDirection::Read)
    }

    pub fn async_write_mem(&self, vemva: u64, data: Vec<u8>) -> Result<RequestId> {
        let size = data.len();
        self.async_bulk_transfer(vemva, size, Some(data), BulkDirection::Write)
    }

    pub fn read_mem(&self, vemva: u64, size: usize, timeout: Duration) -> Result<Vec<u8>> {
        let id = self.async_read_mem(vemva, size)?;
        // The result code doesn't carry the bytes directly in this
        // simplified model; the composite closure stashes them and
        // `call_wait_result`'s Ok(_) here is the fragment-count sentinel.
        self.call_wait_result(id, timeout)?;
        self.take_last_bulk_read()
    }

    pub fn write_mem(&self, vemva: u64, data: Vec<u8>, timeout: Duration) -> Result<()> {
        let id = self.async_write_mem(vemva, data)?;
        self.call_wait_result(id, timeout)?;
        Ok(())
    }

    fn take_last_bulk_read(&self) -> Result<Vec<u8>> {
        LAST_BULK_READ.with(|cell| cell.borrow_mut().take()).ok_or(AveoError::ProtocolViolation("no bulk read result pending"))
    }

    /// Fragments `size` bytes into `send_frag`/`recv_frag`-sized chunks and
    /// issues one SENDBUFF/RECVBUFF frame per fragment, waiting on each in
    /// turn. Grounded on `AsyncTransfer.cpp`'s `asyncReadMem`/`asyncWriteMem`.
    fn async_bulk_transfer(
        &self,
        vemva: u64,
        size: usize,
        data: Option<Vec<u8>>,
        direction: BulkDirection,
    ) -> Result<RequestId> {
        self.ensure_running()?;
        let id = self.ids.issue();
        self.outstanding.lock().unwrap().insert(id);

        let transport = self.transport.clone();
        let frag = match direction {
            BulkDirection::Read => self.recv_frag,
            BulkDirection::Write => self.send_frag,
        };
        let fragments = plan_fragments(size, frag);

        let submit = move || -> Result<()> {
            let mut offset = 0usize;
            let mut collected = Vec::with_capacity(size);
            for flen in &fragments {
                let frag_vemva = vemva + offset as u64;
                match direction {
                    BulkDirection::Write => {
                        let chunk = data.as_ref().expect("write transfer always carries data")[offset..offset + flen].to_vec();
                        let frame = Frame::new(CmdCode::SendBuff, vec![Field::U64(frag_vemva), Field::Bytes(chunk)]);
                        transport.send(&frame.encode())?;
                        let reply = transport.recv_timeout(SYNC_TIMEOUT)?;
                        let reply = decode_reply(&reply)?;
                        reply.fields.first().map(|f| f.as_u64()).transpose()?;
                    }
                    BulkDirection::Read => {
                        let frame = Frame::new(CmdCode::RecvBuff, vec![Field::U64(frag_vemva), Field::Size(*flen as u64)]);
                        transport.send(&frame.encode())?;
                        let reply_bytes = transport.recv_timeout(SYNC_TIMEOUT)?;
                        let reply = decode_reply(&reply_bytes)?;
                        let bytes = reply.fields.get(0).map(|f| f.as_bytes()).transpose()?.unwrap_or(&[]);
                        collected.extend_from_slice(bytes);
                    }
                }
                offset += flen;
            }
            if matches!(direction, BulkDirection::Read) {
                LAST_BULK_READ.with(|cell| *cell.borrow_mut() = Some(collected));
            }
            Ok(())
        };
        let complete = move |_payload: &[u8]| -> Result<u64> { Ok(0) };
        let cmd = Command::new(id, true, submit, complete);
        self.queue.push_request(cmd)?;
        Ok(id)
    }
}

#[derive(Clone, Copy)]
enum BulkDirection {
    Read,
    Write,
}

thread_local! {
    static LAST_COMPOSITE_RESULT: std::cell::RefCell<Option<u64>> = std::cell::RefCell::new(None);
    static LAST_BULK_READ: std::cell::RefCell<Option<Vec<u8>>> = std::cell::RefCell::new(None);
}

/// Splits `size` bytes into fragments no larger than `max_frag`, halving or
/// thirding the last stretch when that avoids a small trailing remainder,
/// the same heuristic `AsyncTransfer.cpp` applies for 120KB-512KB buffers.
fn plan_fragments(size: usize, max_frag: usize) -> Vec<usize> {
    if size == 0 {
        return vec![];
    }
    if size <= max_frag {
        return smooth_split(size);
    }
    let mut fragments = Vec::new();
    let mut remaining = size;
    while remaining > max_frag {
        fragments.push(max_frag);
        remaining -= max_frag;
    }
    fragments.extend(smooth_split(remaining));
    fragments
}

fn smooth_split(size: usize) -> Vec<usize> {
    const KB: usize = 1024;
    let parts = if size > 512 * KB {
        4
    } else if size > 240 * KB {
        3
    } else if size > 120 * KB {
        2
    } else {
        1
    };
    if parts == 1 {
        return vec![size];
    }
    let base = align8(size / parts);
    let mut out = Vec::with_capacity(parts);
    let mut remaining = size;
    for _ in 0..parts - 1 {
        out.push(base);
        remaining -= base;
    }
    out.push(remaining);
    out
}

fn align8(v: usize) -> usize {
    (v + 7) & !7
}

fn build_call_frame(func_addr: u64, built: &BuiltCallArgs) -> Frame {
    let regs_bytes: Vec<u8> = built.reg_values.iter().flat_map(|v| v.to_le_bytes()).collect();
    match (built.copied_in, built.copied_out) {
        (false, false) => Frame::new(CmdCode::Call, vec![Field::U64(func_addr), Field::Bytes(regs_bytes)]),
        (true, false) => Frame::new(
            CmdCode::CallStackIn,
            vec![Field::U64(func_addr), Field::Bytes(regs_bytes), Field::U64(built.stack_size), Field::Bytes(built.stack_image.clone())],
        ),
        (false, true) => Frame::new(
            CmdCode::CallStackOut,
            vec![Field::U64(func_addr), Field::Bytes(regs_bytes), Field::U64(built.stack_size), Field::Size(built.stack_size)],
        ),
        (true, true) => Frame::new(
            CmdCode::CallStackInOut,
            vec![Field::U64(func_addr), Field::Bytes(regs_bytes), Field::U64(built.stack_size), Field::Bytes(built.stack_image.clone())],
        ),
    }
}

fn reply_format(cmd: CmdCode) -> &'static str {
    match cmd {
        CmdCode::Ack => "",
        CmdCode::Result => "L",
        CmdCode::ResultStack => "LP",
        CmdCode::Exception => "LP",
        CmdCode::SendBuff => "L",
        CmdCode::RecvBuff => "P",
        _ => "",
    }
}

fn decode_reply(payload: &[u8]) -> Result<Frame> {
    if payload.is_empty() {
        return Err(AveoError::ProtocolViolation("empty reply"));
    }
    let cmd = CmdCode::from_u8(payload[0]).ok_or(AveoError::ProtocolViolation("unknown reply cmd"))?;
    Frame::decode(payload, reply_format(cmd))
}

fn unpack_call_result(reply: &Frame, built: &BuiltCallArgs, args: &mut CallArgs) -> Result<u64> {
    match reply.cmd {
        CmdCode::Result => reply.fields.first().ok_or(AveoError::ProtocolViolation("RESULT missing value"))?.as_u64(),
        CmdCode::ResultStack => {
            let rv = reply.fields.first().ok_or(AveoError::ProtocolViolation("RES_STK missing value"))?.as_u64()?;
            let stack_bytes = reply.fields.get(1).ok_or(AveoError::ProtocolViolation("RES_STK missing stack"))?.as_bytes()?;
            built.copyout(stack_bytes, args)?;
            Ok(rv)
        }
        CmdCode::Exception => {
            let code = reply.fields.first().ok_or(AveoError::ProtocolViolation("EXCEPTION missing code"))?.as_u64()? as i64;
            let message = reply
                .fields
                .get(1)
                .map(|f| f.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned()))
                .transpose()?
                .unwrap_or_default();
            veo_debug!("worker exception {}: {}", code, message);
            Err(AveoError::Exception { code, message })
        }
        _ => Err(AveoError::ProtocolViolation("unexpected reply cmd for a call")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aveo_transport::LoopbackTransport;

    fn echo_transport() -> Arc<dyn Transport> {
        Arc::new(LoopbackTransport::new(|req| {
            let cmd = CmdCode::from_u8(req[0])?;
            match cmd {
                CmdCode::Call | CmdCode::CallStackIn | CmdCode::CallStackOut | CmdCode::CallStackInOut => {
                    Some(Frame::new(CmdCode::Result, vec![Field::U64(7)]).encode())
                }
                CmdCode::Exit => Some(Frame::new(CmdCode::Ack, vec![]).encode()),
                _ => None,
            }
        }))
    }

    fn args(a: CallArgs) -> Arc<Mutex<CallArgs>> {
        Arc::new(Mutex::new(a))
    }

    #[test]
    fn call_sync_returns_the_echoed_value() {
        let ctx = Context::new(echo_transport(), 0x10000);
        let rv = ctx.call_sync(0x1000, args(CallArgs::new())).unwrap();
        assert_eq!(rv, 7);
    }

    #[test]
    fn synchronize_drains_a_fan_out_of_async_calls() {
        let ctx = Context::new(echo_transport(), 0x10000);
        let mut ids = Vec::new();
        for _ in 0..50 {
            ids.push(ctx.call_async(0x2000, args(CallArgs::new())).unwrap());
        }
        ctx.synchronize().unwrap();
        for id in ids {
            assert_eq!(ctx.call_peek_result(id).unwrap().unwrap(), 7);
        }
    }

    #[test]
    fn closing_twice_is_a_no_op() {
        let ctx = Context::new(echo_transport(), 0x10000);
        ctx.close().unwrap();
        assert_eq!(ctx.state(), ContextState::Exit);
        ctx.close().unwrap();
    }

    #[test]
    fn call_after_close_fails() {
        let ctx = Context::new(echo_transport(), 0x10000);
        ctx.close().unwrap();
        assert!(matches!(ctx.call_async(0x3000, args(CallArgs::new())), Err(AveoError::AlreadyExited)));
    }

    #[test]
    fn request_ids_are_never_reused_within_a_context() {
        let ctx = Context::new(echo_transport(), 0x10000);
        let a = ctx.call_async(0x1000, args(CallArgs::new())).unwrap();
        let b = ctx.call_async(0x1000, args(CallArgs::new())).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn fragment_plan_covers_the_whole_size() {
        let fragments = plan_fragments(10 * 1024 * 1024, PART_SENDFRAG_DEFAULT);
        assert_eq!(fragments.iter().sum::<usize>(), 10 * 1024 * 1024);
        assert!(fragments.iter().all(|&f| f <= PART_SENDFRAG_DEFAULT));
    }

    #[test]
    fn fragment_plan_smooths_a_small_buffer() {
        let fragments = plan_fragments(300 * 1024, PART_SENDFRAG_DEFAULT);
        assert_eq!(fragments.iter().sum::<usize>(), 300 * 1024);
        assert!(fragments.len() > 1);
    }
}
