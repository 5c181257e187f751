//! Real shared-memory transport: forks and execs a worker process, attaches
//! a POSIX shared memory segment split into a submit and a completion ring.
//!
//! Grounded on `ProcHandle::ProcHandle`'s peer-create/attach-wait sequence
//! and on `ksvc-executor`'s ring mechanics (adapted to variable-length,
//! request/reply-correlated frames by [`ByteRing`]).

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aveo_core::{veo_debug, veo_warn, AveoError, Result};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;

use crate::ring::ByteRing;

/// Default per-ring capacity, matching `PART_SENDFRAG`'s default of 4 MiB.
pub const DEFAULT_RING_CAPACITY: u64 = 4 * 1024 * 1024;

static NEXT_SHM_SEQ: AtomicU32 = AtomicU32::new(0);

struct MappedRegion {
    ptr: *mut u8,
    len: usize,
    name: CString,
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
            libc::shm_unlink(self.name.as_ptr());
        }
    }
}

/// Shared-memory transport bound to exactly one worker process.
pub struct ShmTransport {
    region: MappedRegion,
    submit: ByteRing,
    completion: ByteRing,
    child: Pid,
    attach_flag: *const AtomicBool,
    ring_capacity: u64,
    worker_bin: PathBuf,
}

unsafe impl Send for ShmTransport {}
unsafe impl Sync for ShmTransport {}

/// Byte offset of the attach flag within the region header, after the two
/// ring headers (each `ByteRing::region_len` bytes, the attach flag sits in
/// the first few bytes of the trailing control block).
fn attach_flag_offset(ring_capacity: u64) -> usize {
    2 * ByteRing::region_len(ring_capacity)
}

fn total_region_len(ring_capacity: u64) -> usize {
    attach_flag_offset(ring_capacity) + 64
}

impl ShmTransport {
    /// Creates the shared memory segment, forks, and execs `worker_bin`
    /// bound to `core`. The child is expected to flip the attach flag once
    /// it has mapped the segment and is ready to read the submit ring; this
    /// call busy-polls for that flag for up to `attach_timeout`.
    pub fn spawn(core: i32, worker_bin: &Path, attach_timeout: Duration) -> Result<ShmTransport> {
        Self::spawn_with_capacity(core, worker_bin, attach_timeout, DEFAULT_RING_CAPACITY)
    }

    pub fn spawn_with_capacity(
        core: i32,
        worker_bin: &Path,
        attach_timeout: Duration,
        ring_capacity: u64,
    ) -> Result<ShmTransport> {
        let seq = NEXT_SHM_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = CString::new(format!("/aveo-{}-{}", std::process::id(), seq))
            .map_err(|_| AveoError::Transport("shm name contains a NUL byte"))?;

        let total_len = total_region_len(ring_capacity);
        let ptr = unsafe { create_shm_region(&name, total_len)? };

        let submit = unsafe { ByteRing::new(ptr, ring_capacity) };
        let completion = unsafe { ByteRing::new(ptr.add(ByteRing::region_len(ring_capacity)), ring_capacity) };
        let attach_flag = unsafe { ptr.add(attach_flag_offset(ring_capacity)) as *const AtomicBool };
        unsafe { (*attach_flag).store(false, Ordering::Release) };

        let child = unsafe { spawn_worker(worker_bin, &name, core)? };

        let deadline = Instant::now() + attach_timeout;
        loop {
            if unsafe { (*attach_flag).load(Ordering::Acquire) } {
                break;
            }
            if Instant::now() >= deadline {
                let _ = kill(child, Signal::SIGKILL);
                let _ = waitpid(child, None);
                unsafe { libc::munmap(ptr as *mut libc::c_void, total_len) };
                unsafe { libc::shm_unlink(name.as_ptr()) };
                return Err(AveoError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        veo_debug!("worker pid {} attached on core {}", child, core);

        Ok(ShmTransport {
            region: MappedRegion { ptr, len: total_len, name },
            submit,
            completion,
            child,
            attach_flag,
            ring_capacity,
            worker_bin: worker_bin.to_path_buf(),
        })
    }

    pub fn child_pid(&self) -> Pid {
        self.child
    }
}

impl Drop for ShmTransport {
    fn drop(&mut self) {
        match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
            Ok(nix::sys::wait::WaitStatus::StillAlive) | Err(_) => {
                if kill(self.child, Signal::SIGTERM).is_ok() {
                    let _ = waitpid(self.child, None);
                }
            }
            Ok(_) => {}
        }
    }
}

impl crate::transport::Transport for ShmTransport {
    fn send(&self, payload: &[u8]) -> Result<()> {
        self.submit.push(payload)
    }

    fn poll_next_reply(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.completion.pop())
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.completion.pop() {
                return Ok(frame);
            }
            if Instant::now() >= deadline {
                return Err(AveoError::Timeout);
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    fn max_send_payload(&self) -> usize {
        (self.ring_capacity / 2) as usize
    }

    /// Forks and execs a brand new worker process on its own shared-memory
    /// segment; a context never shares a ring with another context.
    fn create_peer(&self, core: i32, _stacksize: u64) -> Result<(Arc<dyn crate::transport::Transport>, i32)> {
        let peer = ShmTransport::spawn_with_capacity(core, &self.worker_bin, Duration::from_secs(10), self.ring_capacity)?;
        let segid = peer.child_pid().as_raw();
        Ok((Arc::new(peer), segid))
    }
}

unsafe fn create_shm_region(name: &CString, len: usize) -> Result<*mut u8> {
    let fd = libc::shm_open(name.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600);
    if fd < 0 {
        return Err(AveoError::Os(*libc::__errno_location()));
    }
    if libc::ftruncate(fd, len as libc::off_t) != 0 {
        let err = *libc::__errno_location();
        libc::close(fd);
        libc::shm_unlink(name.as_ptr());
        return Err(AveoError::Os(err));
    }
    let ptr = libc::mmap(
        ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        fd,
        0,
    );
    libc::close(fd);
    if ptr == libc::MAP_FAILED {
        libc::shm_unlink(name.as_ptr());
        return Err(AveoError::Os(*libc::__errno_location()));
    }
    ptr::write_bytes(ptr as *mut u8, 0, len);
    Ok(ptr as *mut u8)
}

unsafe fn spawn_worker(worker_bin: &Path, shm_name: &CString, core: i32) -> Result<Pid> {
    use nix::unistd::{execv, fork, ForkResult};

    match fork().map_err(|e| AveoError::Os(e as i32))? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let path = CString::new(worker_bin.as_os_str().as_encoded_bytes())
                .unwrap_or_else(|_| CString::new("veorun").unwrap());
            let core_arg = CString::new(core.to_string()).unwrap();
            let argv = [path.as_c_str(), shm_name.as_c_str(), core_arg.as_c_str()];
            // execv only returns on failure; if it returns we're still the
            // forked child, so exit rather than unwind back into the parent.
            let _ = execv(&path, &argv);
            veo_warn!("execv of worker binary failed");
            libc::_exit(127);
        }
    }
}
