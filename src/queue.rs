//! Capacity-bounded blocking FIFO shared between the workers and the
//! upper layer.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A bounded multi-producer FIFO with blocking take semantics.
///
/// Producers never block: [`BoundedQueue::offer`] returns `false` when
/// the queue is at capacity, which lets the receive loop discard
/// overflow instead of stalling its RF poll. Consumers block in
/// [`BoundedQueue::take`] or bound their wait with
/// [`BoundedQueue::poll`]. Closing the queue wakes all blocked
/// consumers.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    capacity: usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue without blocking. Returns `false` if the queue is full
    /// or closed.
    pub fn offer(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed || inner.items.len() >= self.capacity {
            return false;
        }

        inner.items.push_back(item);
        self.available.notify_one();

        true
    }

    /// Block until an item is available. Returns `None` once the queue
    /// is closed and drained.
    pub fn take(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();

        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }

            inner = self.available.wait(inner).unwrap();
        }
    }

    /// Block for up to `timeout`. Returns `None` on timeout or once the
    /// queue is closed and drained.
    pub fn poll(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();

        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            let (guard, result) = self.available.wait_timeout(inner, remaining).unwrap();
            inner = guard;

            if result.timed_out() && inner.items.is_empty() {
                return None;
            }
        }
    }

    /// Close the queue, waking every blocked consumer. Items already
    /// queued may still be drained.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn fifo_order() {
        let q = BoundedQueue::new(10);

        assert!(q.offer(1));
        assert!(q.offer(2));
        assert!(q.offer(3));

        assert_eq!(q.take(), Some(1));
        assert_eq!(q.take(), Some(2));
        assert_eq!(q.take(), Some(3));
    }

    #[test]
    fn rejects_when_full() {
        let q = BoundedQueue::new(2);

        assert!(q.offer(1));
        assert!(q.offer(2));
        assert!(!q.offer(3));
        assert_eq!(q.len(), 2);

        q.take();
        assert!(q.offer(3));
    }

    #[test]
    fn poll_times_out() {
        let q: BoundedQueue<u8> = BoundedQueue::new(4);

        let started = Instant::now();
        assert_eq!(q.poll(Duration::from_millis(20)), None);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn take_blocks_until_offer() {
        let q = Arc::new(BoundedQueue::new(4));
        let producer = q.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.offer(7u8);
        });

        assert_eq!(q.take(), Some(7));
        handle.join().unwrap();
    }

    #[test]
    fn close_unblocks_consumers() {
        let q: Arc<BoundedQueue<u8>> = Arc::new(BoundedQueue::new(4));
        let closer = q.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });

        assert_eq!(q.take(), None);
        assert!(!q.offer(1));
        handle.join().unwrap();
    }
}
