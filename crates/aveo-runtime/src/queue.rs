//! `BlockingQueue<T>` and `BlockingMap<K, V>`: the mutex/condvar primitives
//! `CommQueue` is built from, grounded on `Command.hpp`'s `BlockingQueue`
//! and `BlockingMap`.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use aveo_core::QueueState;

/// A deque guarded by a mutex and a condvar, open or closed.
pub struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    cv: Condvar,
    state: Mutex<QueueState>,
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        BlockingQueue { items: Mutex::new(VecDeque::new()), cv: Condvar::new(), state: Mutex::new(QueueState::Ready) }
    }

    pub fn push(&self, item: T) -> Result<(), T> {
        if matches!(*self.state.lock().unwrap(), QueueState::Closed) {
            return Err(item);
        }
        self.items.lock().unwrap().push_back(item);
        self.cv.notify_all();
        Ok(())
    }

    pub fn push_front(&self, item: T) -> Result<(), T> {
        if matches!(*self.state.lock().unwrap(), QueueState::Closed) {
            return Err(item);
        }
        self.items.lock().unwrap().push_front(item);
        self.cv.notify_all();
        Ok(())
    }

    /// Non-blocking pop from the front.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    /// Blocks until an item is available or the queue is closed and empty.
    pub fn pop(&self) -> Option<T> {
        let mut guard = self.items.lock().unwrap();
        loop {
            if let Some(item) = guard.pop_front() {
                return Some(item);
            }
            if matches!(*self.state.lock().unwrap(), QueueState::Closed) {
                return None;
            }
            guard = self.cv.wait(guard).unwrap();
        }
    }

    pub fn close(&self) {
        *self.state.lock().unwrap() = QueueState::Closed;
        self.cv.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// Empties the queue, handing every drained item to `f`.
    pub fn drain_into(&self, mut f: impl FnMut(T)) {
        let mut guard = self.items.lock().unwrap();
        while let Some(item) = guard.pop_front() {
            f(item);
        }
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A map guarded by a mutex and a condvar, used for completion results keyed
/// by request id.
pub struct BlockingMap<K, V> {
    items: Mutex<HashMap<K, V>>,
    cv: Condvar,
}

impl<K: Eq + Hash + Clone, V> BlockingMap<K, V> {
    pub fn new() -> Self {
        BlockingMap { items: Mutex::new(HashMap::new()), cv: Condvar::new() }
    }

    pub fn insert(&self, key: K, value: V) {
        self.items.lock().unwrap().insert(key, value);
        self.cv.notify_all();
    }

    /// Removes and returns the value for `key` if present.
    pub fn try_find(&self, key: &K) -> Option<V> {
        self.items.lock().unwrap().remove(key)
    }

    /// Blocks until `key` is present (or `timeout` elapses), removing and
    /// returning it.
    pub fn wait(&self, key: &K, timeout: Duration) -> Option<V> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.items.lock().unwrap();
        loop {
            if let Some(v) = guard.remove(key) {
                return Some(v);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (g, result) = self.cv.wait_timeout(guard, remaining).unwrap();
            guard = g;
            if result.timed_out() && !guard.contains_key(key) {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

impl<K: Eq + Hash + Clone, V> Default for BlockingMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_then_pop_is_fifo() {
        let q = BlockingQueue::new();
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn push_front_takes_priority() {
        let q = BlockingQueue::new();
        q.push(1).unwrap();
        q.push_front(0).unwrap();
        assert_eq!(q.try_pop(), Some(0));
        assert_eq!(q.try_pop(), Some(1));
    }

    #[test]
    fn closed_queue_rejects_push_and_unblocks_pop() {
        let q: Arc<BlockingQueue<i32>> = Arc::new(BlockingQueue::new());
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(handle.join().unwrap(), None);
        assert!(q.push(5).is_err());
    }

    #[test]
    fn blocking_pop_wakes_on_push() {
        let q: Arc<BlockingQueue<i32>> = Arc::new(BlockingQueue::new());
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(20));
        q.push(7).unwrap();
        assert_eq!(handle.join().unwrap(), Some(7));
    }

    #[test]
    fn map_wait_times_out_when_absent() {
        let m: BlockingMap<u64, i32> = BlockingMap::new();
        assert_eq!(m.wait(&1, Duration::from_millis(10)), None);
    }

    #[test]
    fn map_wait_finds_value_inserted_concurrently() {
        let m: Arc<BlockingMap<u64, i32>> = Arc::new(BlockingMap::new());
        let m2 = m.clone();
        let handle = thread::spawn(move || m2.wait(&1, Duration::from_secs(1)));
        thread::sleep(Duration::from_millis(20));
        m.insert(1, 42);
        assert_eq!(handle.join().unwrap(), Some(42));
        assert!(m.is_empty());
    }
}
