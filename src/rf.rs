//! The radio seam: the trait the core consumes, plus a shared-medium
//! mock for tests.

/// Virtual RF device consumed by the link layer.
///
/// The device is assumed to be internally synchronized: `receive`,
/// `transmit`, `in_use` and `clock` may be called concurrently from
/// the receive and transmit workers. The link layer additionally
/// serializes its own writes (the transmitter FSM and the receiver's
/// inline ACK) behind a transient lock.
pub trait Rf: Send + Sync {
    /// Block until a frame arrives on the medium.
    fn receive(&self) -> Vec<u8>;

    /// Put a frame on the air.
    fn transmit(&self, frame: &[u8]);

    /// Carrier sense: is the medium currently busy.
    fn in_use(&self) -> bool;

    /// Millisecond-resolution monotonic clock.
    fn clock(&self) -> i64;

    /// Short inter-frame space in ms.
    fn sifs_time(&self) -> u64;

    /// Backoff slot length in ms.
    fn slot_time(&self) -> u64;

    /// Minimum contention window.
    fn cw_min(&self) -> u32 {
        3
    }

    /// Maximum contention window.
    fn cw_max(&self) -> u32 {
        31
    }

    /// Retransmission attempts before a frame is dropped.
    fn retry_limit(&self) -> u32;
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::config::QUEUE_CAPACITY;
    use crate::queue::BoundedQueue;

    use super::Rf;

    /// Timing constants handed to every endpoint of a [`MockMedium`].
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct MockTiming {
        pub sifs_time: u64,
        pub slot_time: u64,
        pub retry_limit: u32,
    }

    impl Default for MockTiming {
        fn default() -> Self {
            Self {
                sifs_time: 10,
                slot_time: 20,
                retry_limit: 3,
            }
        }
    }

    struct Endpoint {
        rx: BoundedQueue<Vec<u8>>,
        clock_ms: AtomicI64,
        muted: AtomicBool,
    }

    struct MediumInner {
        busy: AtomicBool,
        endpoints: Mutex<Vec<Arc<Endpoint>>>,
        history: Mutex<Vec<Vec<u8>>>,
    }

    /// A shared medium connecting any number of [`MockRf`] endpoints.
    ///
    /// Every unmuted transmission is recorded in the history and
    /// delivered to all other endpoints. Carrier sense is a manual
    /// flag so tests can park the transmitter in its busy states, and
    /// each endpoint's clock is set by hand so clock-sync tests are
    /// deterministic. Muting an endpoint loses its transmissions
    /// before they reach the air.
    #[derive(Clone)]
    pub struct MockMedium {
        inner: Arc<MediumInner>,
    }

    impl MockMedium {
        pub fn new() -> Self {
            Self {
                inner: Arc::new(MediumInner {
                    busy: AtomicBool::new(false),
                    endpoints: Mutex::new(Vec::new()),
                    history: Mutex::new(Vec::new()),
                }),
            }
        }

        /// Attach a new radio to the medium.
        pub fn endpoint(&self, timing: MockTiming) -> MockRf {
            let endpoint = Arc::new(Endpoint {
                rx: BoundedQueue::new(QUEUE_CAPACITY),
                clock_ms: AtomicI64::new(0),
                muted: AtomicBool::new(false),
            });

            self.inner.endpoints.lock().unwrap().push(endpoint.clone());

            MockRf {
                medium: self.inner.clone(),
                endpoint,
                timing,
            }
        }

        pub fn set_busy(&self, busy: bool) {
            self.inner.busy.store(busy, Ordering::SeqCst);
        }

        /// Every frame put on the air so far, oldest first.
        pub fn history(&self) -> Vec<Vec<u8>> {
            self.inner.history.lock().unwrap().clone()
        }

        /// Close every endpoint, releasing receivers blocked in
        /// `receive`.
        pub fn close(&self) {
            for endpoint in self.inner.endpoints.lock().unwrap().iter() {
                endpoint.rx.close();
            }
        }
    }

    /// One radio on a [`MockMedium`].
    ///
    /// Clones share the same endpoint, so a test can keep a handle for
    /// clock control while the link layer owns the other.
    #[derive(Clone)]
    pub struct MockRf {
        medium: Arc<MediumInner>,
        endpoint: Arc<Endpoint>,
        timing: MockTiming,
    }

    impl MockRf {
        pub fn set_clock(&self, ms: i64) {
            self.endpoint.clock_ms.store(ms, Ordering::SeqCst);
        }

        /// Lose this endpoint's transmissions before they reach the
        /// air.
        pub fn set_muted(&self, muted: bool) {
            self.endpoint.muted.store(muted, Ordering::SeqCst);
        }
    }

    impl Rf for MockRf {
        fn receive(&self) -> Vec<u8> {
            self.endpoint.rx.take().unwrap_or_default()
        }

        fn transmit(&self, frame: &[u8]) {
            if self.endpoint.muted.load(Ordering::SeqCst) {
                return;
            }

            self.medium.history.lock().unwrap().push(frame.to_vec());

            for other in self.medium.endpoints.lock().unwrap().iter() {
                if Arc::ptr_eq(other, &self.endpoint) {
                    continue;
                }
                other.rx.offer(frame.to_vec());
            }
        }

        fn in_use(&self) -> bool {
            self.medium.busy.load(Ordering::SeqCst)
        }

        fn clock(&self) -> i64 {
            self.endpoint.clock_ms.load(Ordering::SeqCst)
        }

        fn sifs_time(&self) -> u64 {
            self.timing.sifs_time
        }

        fn slot_time(&self) -> u64 {
            self.timing.slot_time
        }

        fn retry_limit(&self) -> u32 {
            self.timing.retry_limit
        }
    }

}
