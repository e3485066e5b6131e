//! Upper-layer surface: datagram send/receive, the status word, the
//! command interface, sequence numbering, clock offset and the beacon
//! schedule. Construction spawns the receive and transmit workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::config::{LinkConfig, QUEUE_CAPACITY, SENDER_FUDGE_FACTOR_MS, SEND_QUEUE_LIMIT};
use crate::frame::{Frame, FrameType, BROADCAST_ADDR};
use crate::queue::BoundedQueue;
use crate::receive::Receiver;
use crate::rf::Rf;
use crate::status;
use crate::transmit::Transmitter;
use crate::Transmission;

/// Wall-clock milliseconds, used for beacon scheduling and the 50 ms
/// transmission alignment.
pub(crate) fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// State shared by the upper layer and both workers.
pub(crate) struct Shared<R> {
    pub(crate) rf: R,
    pub(crate) our_mac: i16,

    /// Serializes RF writes: the transmitter FSM and the receiver's
    /// inline ACK both put frames on the air.
    tx_guard: Mutex<()>,

    pub(crate) status: AtomicI32,

    /// Added to the RF clock to form the local clock. Only ever
    /// advances, via beacon reception.
    offset_ms: AtomicI64,

    /// Wall-clock stamp of the last transmission that reset the beacon
    /// timer (any transmission out of the idle-DIFS path does).
    last_beacon_sent: AtomicI64,

    /// Last sequence number transmitted, per destination. The beacon
    /// path uses the broadcast pseudo-destination.
    seq_nums: Mutex<HashMap<i16, u16>>,

    debug: AtomicBool,
    max_slot_select: AtomicBool,
    beacon_disabled: AtomicBool,
    beacon_interval_ms: AtomicI64,

    pub(crate) ack_tx_time: std::time::Duration,

    pub(crate) send_queue: BoundedQueue<Vec<u8>>,
    pub(crate) recv_queue: BoundedQueue<Vec<u8>>,
    pub(crate) ack_queue: BoundedQueue<Frame>,

    shutdown: AtomicBool,
}

impl<R: Rf> Shared<R> {
    pub(crate) fn new(our_mac: i16, rf: R, config: &LinkConfig) -> Self {
        Self {
            rf,
            our_mac,
            tx_guard: Mutex::new(()),
            status: AtomicI32::new(0),
            offset_ms: AtomicI64::new(0),
            last_beacon_sent: AtomicI64::new(0),
            seq_nums: Mutex::new(HashMap::new()),
            debug: AtomicBool::new(config.debug),
            max_slot_select: AtomicBool::new(config.max_slot_select),
            beacon_disabled: AtomicBool::new(true),
            beacon_interval_ms: AtomicI64::new(0),
            ack_tx_time: config.ack_tx_time,
            send_queue: BoundedQueue::new(QUEUE_CAPACITY),
            recv_queue: BoundedQueue::new(QUEUE_CAPACITY),
            ack_queue: BoundedQueue::new(QUEUE_CAPACITY),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Local clock view: RF clock plus the beacon-driven offset.
    pub(crate) fn local_clock(&self) -> i64 {
        self.rf.clock() + self.offset_ms.load(Ordering::SeqCst)
    }

    /// Advance the clock offset. Single writer (the receiver), so the
    /// offset never retreats.
    pub(crate) fn advance_offset(&self, diff_ms: i64) {
        self.offset_ms.fetch_add(diff_ms, Ordering::SeqCst);
    }

    /// Draw the next sequence number for a destination: 0 on first
    /// use, previous + 1 modulo 4096 afterwards.
    pub(crate) fn next_seq(&self, dest: i16) -> u16 {
        let mut seq_nums = self.seq_nums.lock().unwrap();

        let seq = match seq_nums.get(&dest) {
            Some(prev) => (prev + 1) % 4096,
            None => 0,
        };
        seq_nums.insert(dest, seq);

        seq
    }

    /// Put bytes on the air under the write guard.
    pub(crate) fn transmit_on_rf(&self, bytes: &[u8]) {
        let _guard = self.tx_guard.lock().unwrap();
        self.rf.transmit(bytes);
    }

    /// Stamp the beacon timer with the current wall clock.
    pub(crate) fn record_transmission_time(&self) {
        self.last_beacon_sent.store(wall_clock_ms(), Ordering::SeqCst);
    }

    pub(crate) fn set_status(&self, status: i32) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub(crate) fn debug_enabled(&self) -> bool {
        self.debug.load(Ordering::SeqCst)
    }

    pub(crate) fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::SeqCst);
    }

    pub(crate) fn max_slot_select(&self) -> bool {
        self.max_slot_select.load(Ordering::SeqCst)
    }

    pub(crate) fn set_max_slot_select(&self, max: bool) {
        self.max_slot_select.store(max, Ordering::SeqCst);
    }

    pub(crate) fn beacons_enabled(&self) -> bool {
        !self.beacon_disabled.load(Ordering::SeqCst)
    }

    pub(crate) fn beacon_interval_ms(&self) -> i64 {
        self.beacon_interval_ms.load(Ordering::SeqCst)
    }

    pub(crate) fn enable_beacons(&self, interval_secs: i32) {
        self.beacon_interval_ms
            .store(interval_secs as i64 * 1000, Ordering::SeqCst);
        self.beacon_disabled.store(false, Ordering::SeqCst);
    }

    pub(crate) fn disable_beacons(&self) {
        self.beacon_disabled.store(true, Ordering::SeqCst);
    }

    /// Has the beacon interval elapsed since the last transmission
    /// stamp.
    pub(crate) fn is_time_to_beacon(&self) -> bool {
        let last = self.last_beacon_sent.load(Ordering::SeqCst);
        wall_clock_ms() - last >= self.beacon_interval_ms()
    }

    /// Build the next beacon: local clock plus the sender-side fudge
    /// factor, broadcast destination, next broadcast sequence number.
    pub(crate) fn create_beacon(&self) -> Frame {
        let seq = self.next_seq(BROADCAST_ADDR);
        let timestamp = self.local_clock() + SENDER_FUDGE_FACTOR_MS;

        Frame::beacon(self.our_mac, timestamp, seq)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// The 802.11-style link layer.
///
/// Construction attaches to an RF device and spawns the two workers;
/// the handle then exposes the datagram API to the layer above. All
/// methods take `&self` and may be called from any thread.
pub struct LinkLayer<R: Rf> {
    shared: Arc<Shared<R>>,
}

impl<R: Rf + 'static> LinkLayer<R> {
    /// Create a link layer with default configuration.
    pub fn new(our_mac: i16, rf: R) -> Self {
        Self::with_config(our_mac, rf, LinkConfig::default())
    }

    pub fn with_config(our_mac: i16, rf: R, config: LinkConfig) -> Self {
        let shared = Arc::new(Shared::new(our_mac, rf, &config));

        info!("link layer initialized with MAC address {}", our_mac);

        let receiver = Receiver::new(shared.clone());
        let transmitter = Transmitter::new(shared.clone());

        thread::Builder::new()
            .name("wlan-recv".into())
            .spawn(move || receiver.run())
            .expect("failed to spawn receive worker");

        thread::Builder::new()
            .name("wlan-xmit".into())
            .spawn(move || transmitter.run())
            .expect("failed to spawn transmit worker");

        Self { shared }
    }

    /// Queue `len` bytes of `data` for `dest`. Returns the number of
    /// bytes accepted, or 0 (with status `TX_FAILED`) when four frames
    /// are already waiting.
    pub fn send(&self, dest: i16, data: &[u8], len: usize) -> i32 {
        if self.shared.send_queue.len() >= SEND_QUEUE_LIMIT {
            self.shared.set_status(status::TX_FAILED);
            return 0;
        }

        let seq = self.shared.next_seq(dest);
        let frame = Frame::new(FrameType::Data, false, self.shared.our_mac, dest, data, len, seq);

        if self.shared.debug_enabled() {
            debug!("queuing {} bytes for {}", len, dest);
        }

        if !self.shared.send_queue.offer(frame.encode()) {
            warn!("send queue rejected frame for {}", dest);
            self.shared.set_status(status::TX_FAILED);
            return 0;
        }

        len as i32
    }

    /// Block until a datagram arrives, then fill the transmission
    /// object. Returns the payload length, or -1 after shutdown.
    pub fn recv(&self, t: &mut Transmission) -> i32 {
        let bytes = match self.shared.recv_queue.take() {
            Some(bytes) => bytes,
            None => return -1,
        };

        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("undersized frame on receive queue: {:?}", e);
                return -1;
            }
        };

        t.buf = frame.payload().to_vec();
        t.source_addr = frame.source;
        t.dest_addr = frame.dest;

        info!("received {} bytes", t.buf.len());

        self.shared.set_status(status::RX_OK);
        t.buf.len() as i32
    }

    /// Current status word.
    pub fn status(&self) -> i32 {
        self.shared.status.load(Ordering::SeqCst)
    }

    /// Runtime command surface: settings summary, debug output, slot
    /// selection mode, beacon interval.
    pub fn command(&self, cmd: i32, val: i32) -> i32 {
        match cmd {
            0 => {
                let beacon_secs = if self.shared.beacons_enabled() {
                    self.shared.beacon_interval_ms() / 1000
                } else {
                    -1
                };

                info!("-------------- commands and settings -----------------");
                info!("cmd 0: display command options and current settings");
                info!("cmd 1: set debug level, currently {}", self.shared.debug_enabled());
                info!("       use -1 for full debug output, 0 for no output");
                info!(
                    "cmd 2: set slot selection, currently {}",
                    if self.shared.max_slot_select() { "maxCW" } else { "random" }
                );
                info!("       use 0 for random slot selection, any other value for maxCW");
                info!("cmd 3: set beacon interval, currently {} seconds", beacon_secs);
                info!("       value is seconds between beacon starts, -1 disables");
                info!("------------------------------------------------------");
            }

            1 => match val {
                -1 => {
                    self.shared.set_debug(true);
                    info!("debug output enabled");
                }
                0 => self.shared.set_debug(false),
                _ => (),
            },

            2 => self.shared.set_max_slot_select(val != 0),

            3 => {
                if val == -1 {
                    self.shared.disable_beacons();
                    info!("beacon frames will never be sent");
                } else if val > 0 {
                    self.shared.enable_beacons(val);
                    info!("beacon frames will be sent every {} seconds", val);
                    self.send_initial_beacon();
                }
                // val == 0 is meaningless and silently ignored
            }

            _ => warn!("not a valid command: {}", cmd),
        }

        0
    }

    /// This station's clock view: RF clock plus beacon offset.
    pub fn local_clock(&self) -> i64 {
        self.shared.local_clock()
    }

    /// Raise the exit flag and close the queues. Workers observe the
    /// flag at the top of their loops; a receiver parked inside
    /// `rf.receive` exits at its next reception.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.send_queue.close();
        self.shared.recv_queue.close();
        self.shared.ack_queue.close();
    }

    /// Arm the beacon schedule: if the channel is idle, queue an
    /// immediate beacon. A transmission in flight postpones the first
    /// beacon to the regular schedule.
    fn send_initial_beacon(&self) {
        if !self.shared.rf.in_use() {
            let beacon = self.shared.create_beacon();
            self.shared.send_queue.offer(beacon.encode());
            self.shared.record_transmission_time();
        }
    }
}

impl<R: Rf> Drop for LinkLayer<R> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.send_queue.close();
        self.shared.recv_queue.close();
        self.shared.ack_queue.close();
    }
}
