//! A byte-oriented SPSC ring over a shared memory region.
//!
//! Layout: a 64-byte header (`head: u64` at offset 0, `tail: u64` at offset
//! 8) followed by `capacity` bytes of data. `capacity` must be a power of
//! two. Each entry is `len: u32` followed by `len` bytes, so unlike
//! `ksvc-executor`'s fixed-slot rings this one carries variable-length
//! frames; head/tail are monotonic byte offsets masked by `capacity - 1`.

use std::sync::atomic::{AtomicU64, Ordering};

use aveo_core::AveoError;

pub const HEADER_LEN: usize = 64;

pub struct ByteRing {
    base: *mut u8,
    capacity: u64,
    mask: u64,
}

unsafe impl Send for ByteRing {}
unsafe impl Sync for ByteRing {}

impl ByteRing {
    /// # Safety
    /// `base` must point to at least `HEADER_LEN + capacity` writable bytes
    /// for the lifetime of this `ByteRing`, and `capacity` must be a power
    /// of two.
    pub unsafe fn new(base: *mut u8, capacity: u64) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        ByteRing { base, capacity, mask: capacity - 1 }
    }

    fn head(&self) -> &AtomicU64 {
        unsafe { &*(self.base as *const AtomicU64) }
    }

    fn tail(&self) -> &AtomicU64 {
        unsafe { &*(self.base.add(8) as *const AtomicU64) }
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(HEADER_LEN) }
    }

    fn write_bytes(&self, offset: u64, bytes: &[u8]) {
        let data = self.data_ptr();
        for (i, b) in bytes.iter().enumerate() {
            let pos = (offset + i as u64) & self.mask;
            unsafe { std::ptr::write_volatile(data.add(pos as usize), *b) };
        }
    }

    fn read_bytes(&self, offset: u64, len: usize) -> Vec<u8> {
        let data = self.data_ptr();
        let mut out = Vec::with_capacity(len);
        for i in 0..len as u64 {
            let pos = (offset + i) & self.mask;
            out.push(unsafe { std::ptr::read_volatile(data.add(pos as usize)) });
        }
        out
    }

    /// Appends a length-prefixed frame. Fails with `Transport` if the ring
    /// does not currently have room.
    pub fn push(&self, payload: &[u8]) -> Result<(), AveoError> {
        let entry_len = 4 + payload.len() as u64;
        let tail = self.tail().load(Ordering::Relaxed);
        let head = self.head().load(Ordering::Acquire);
        let used = tail - head;
        if used + entry_len > self.capacity {
            return Err(AveoError::Transport("ring full"));
        }
        self.write_bytes(tail, &(payload.len() as u32).to_le_bytes());
        self.write_bytes(tail + 4, payload);
        self.tail().store(tail + entry_len, Ordering::Release);
        Ok(())
    }

    /// Pops the oldest frame, if any.
    pub fn pop(&self) -> Option<Vec<u8>> {
        let head = self.head().load(Ordering::Relaxed);
        let tail = self.tail().load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let len_bytes = self.read_bytes(head, 4);
        let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
        let payload = self.read_bytes(head + 4, len);
        self.head().store(head + 4 + len as u64, Ordering::Release);
        Some(payload)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Total shared-memory bytes a ring of this capacity occupies.
    pub fn region_len(capacity: u64) -> usize {
        HEADER_LEN + capacity as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_ring(capacity: u64) -> (Vec<u8>, ByteRing) {
        let mut buf = vec![0u8; ByteRing::region_len(capacity)];
        let ring = unsafe { ByteRing::new(buf.as_mut_ptr(), capacity) };
        (buf, ring)
    }

    #[test]
    fn push_pop_round_trip() {
        let (_buf, ring) = new_ring(64);
        ring.push(b"hello").unwrap();
        ring.push(b"world").unwrap();
        assert_eq!(ring.pop().unwrap(), b"hello");
        assert_eq!(ring.pop().unwrap(), b"world");
        assert!(ring.pop().is_none());
    }

    #[test]
    fn push_fails_when_full() {
        let (_buf, ring) = new_ring(16);
        assert!(ring.push(&[0u8; 20]).is_err());
    }

    #[test]
    fn wraps_around_the_ring_boundary() {
        let (_buf, ring) = new_ring(32);
        for _ in 0..3 {
            ring.push(&[1, 2, 3, 4]).unwrap();
            assert_eq!(ring.pop().unwrap(), vec![1, 2, 3, 4]);
        }
        // at this point head/tail have advanced past the first lap
        ring.push(&[9; 10]).unwrap();
        assert_eq!(ring.pop().unwrap(), vec![9; 10]);
    }
}
