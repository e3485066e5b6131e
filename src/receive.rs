//! Receive worker: polls the RF device, classifies frames and routes
//! them to the receive queue, the ACK queue, or the clock offset.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, trace};

use crate::config::{RECV_FUDGE_FACTOR_MS, RECV_QUEUE_LIMIT};
use crate::frame::{Frame, FrameType, BROADCAST_ADDR};
use crate::link::Shared;
use crate::rf::Rf;

pub(crate) struct Receiver<R> {
    shared: Arc<Shared<R>>,
}

impl<R: Rf> Receiver<R> {
    pub(crate) fn new(shared: Arc<Shared<R>>) -> Self {
        Self { shared }
    }

    /// Worker loop, one pass per RF reception.
    pub(crate) fn run(self) {
        info!("receiver started");

        loop {
            if self.shared.is_shutdown() {
                break;
            }

            let bytes = self.shared.rf.receive();

            let frame = match Frame::decode(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("dropping undersized reception: {:?}", e);
                    continue;
                }
            };

            if !frame.crc_ok {
                debug!("dropping frame with bad FCS: {}", frame);
                continue;
            }

            match (frame.frame_type, frame.dest) {
                (FrameType::Data, dest) if dest == self.shared.our_mac => {
                    self.handle_data(frame, bytes);
                }
                (FrameType::Data, BROADCAST_ADDR) => {
                    if self.shared.debug_enabled() {
                        debug!("queued incoming broadcast DATA: {}", frame);
                    }
                    // Broadcasts bypass the unicast admission gate and
                    // are never acknowledged.
                    self.shared.recv_queue.offer(bytes);
                }
                (FrameType::Ack, dest) if dest == self.shared.our_mac => {
                    if !self.shared.ack_queue.offer(frame) {
                        debug!("ACK queue full, discarding");
                    }
                }
                (FrameType::Beacon, BROADCAST_ADDR) => {
                    self.handle_beacon(&frame);
                }
                (FrameType::Data, _) => {
                    if self.shared.debug_enabled() {
                        trace!("got DATA from {} but it's not for us: {}", frame.source, frame);
                    }
                }
                (FrameType::Ack, _) => {
                    if self.shared.debug_enabled() {
                        trace!("saw someone ACK for someone else: {}", frame);
                    }
                }
                _ => {
                    trace!("dropping unhandled frame: {}", frame);
                }
            }
        }

        info!("receiver stopped");
    }

    /// Unicast DATA for this station: queue it while fewer than four
    /// frames await the upper layer, then ACK after SIFS. A frame
    /// refused by the gate is dropped without acknowledgement.
    fn handle_data(&self, frame: Frame, bytes: Vec<u8>) {
        if self.shared.recv_queue.len() >= RECV_QUEUE_LIMIT {
            return;
        }

        if self.shared.debug_enabled() {
            debug!("queued incoming DATA with good FCS: {}", frame);
        }

        self.shared.recv_queue.offer(bytes);

        let ack = Frame::ack_for(&frame);

        thread::sleep(Duration::from_millis(self.shared.rf.sifs_time()));

        if self.shared.debug_enabled() {
            debug!("sending ACK back to {}: {}", ack.dest, ack);
        }

        self.shared.transmit_on_rf(&ack.encode());
    }

    /// Broadcast beacon: compensate the timestamp for receive-path
    /// latency and advance the local clock if the sender is ahead.
    fn handle_beacon(&self, frame: &Frame) {
        let Some(remote) = frame.timestamp() else {
            debug!("beacon without an 8-byte timestamp, ignoring: {}", frame);
            return;
        };

        let adjusted = remote - RECV_FUDGE_FACTOR_MS;
        let local = self.shared.local_clock();

        if adjusted > local {
            let diff = adjusted - local;
            self.shared.advance_offset(diff);

            if self.shared.debug_enabled() {
                debug!(
                    "advanced our clock by {} due to beacon: incoming {} vs our {}, time is now {}",
                    diff,
                    adjusted,
                    local,
                    self.shared.local_clock()
                );
            }
        } else if self.shared.debug_enabled() {
            debug!("ignored beacon: incoming timestamp {} vs our {}", remote, local);
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use crate::config::LinkConfig;
    use crate::rf::mock::{MockMedium, MockRf, MockTiming};

    use super::*;

    fn spawn_receiver(medium: &MockMedium) -> (Arc<Shared<MockRf>>, MockRf) {
        let rf = medium.endpoint(MockTiming::default());
        let shared = Arc::new(Shared::new(23, rf.clone(), &LinkConfig::default()));

        let receiver = Receiver::new(shared.clone());
        thread::spawn(move || receiver.run());

        (shared, rf)
    }

    fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn unicast_data_is_queued_and_acked() {
        let medium = MockMedium::new();
        let (shared, _rf) = spawn_receiver(&medium);
        let injector = medium.endpoint(MockTiming::default());

        let data = Frame::new(FrameType::Data, false, 17, 23, b"hello", 5, 3);
        injector.transmit(&data.encode());

        assert!(wait_until(1000, || shared.recv_queue.len() == 1));
        assert!(wait_until(1000, || medium.history().len() == 2));

        let ack = Frame::decode(medium.history().last().unwrap()).unwrap();
        assert_eq!(ack.frame_type, FrameType::Ack);
        assert_eq!(ack.source, 23);
        assert_eq!(ack.dest, 17);
        assert_eq!(ack.seq, 3);
    }

    #[test]
    fn unicast_gate_drops_fifth_frame() {
        let medium = MockMedium::new();
        let (shared, _rf) = spawn_receiver(&medium);
        let injector = medium.endpoint(MockTiming::default());

        for seq in 0..5u16 {
            let data = Frame::new(FrameType::Data, false, 17, 23, b"x", 1, seq);
            injector.transmit(&data.encode());
        }

        // four queued, four ACKs; the fifth frame vanished silently
        assert!(wait_until(2000, || medium.history().len() == 9));
        thread::sleep(Duration::from_millis(100));

        assert_eq!(shared.recv_queue.len(), 4);
        assert_eq!(medium.history().len(), 9);

        let acks = medium
            .history()
            .iter()
            .filter(|b| Frame::decode(b).unwrap().frame_type == FrameType::Ack)
            .count();
        assert_eq!(acks, 4);
    }

    #[test]
    fn broadcast_data_bypasses_gate_and_skips_ack() {
        let medium = MockMedium::new();
        let (shared, _rf) = spawn_receiver(&medium);
        let injector = medium.endpoint(MockTiming::default());

        for seq in 0..5u16 {
            let data = Frame::new(FrameType::Data, false, 17, BROADCAST_ADDR, b"b", 1, seq);
            injector.transmit(&data.encode());
        }

        assert!(wait_until(1000, || shared.recv_queue.len() == 5));
        thread::sleep(Duration::from_millis(50));

        // only the five injected frames are on the air, no ACKs
        assert_eq!(medium.history().len(), 5);
    }

    #[test]
    fn acks_for_us_are_routed_to_the_ack_queue() {
        let medium = MockMedium::new();
        let (shared, _rf) = spawn_receiver(&medium);
        let injector = medium.endpoint(MockTiming::default());

        let ack = Frame::new(FrameType::Ack, false, 17, 23, &[], 0, 7);
        injector.transmit(&ack.encode());

        assert!(wait_until(1000, || shared.ack_queue.len() == 1));

        let queued = shared.ack_queue.take().unwrap();
        assert_eq!(queued.seq, 7);
        assert_eq!(queued.source, 17);

        // an ACK for someone else is not routed
        let other = Frame::new(FrameType::Ack, false, 17, 99, &[], 0, 8);
        injector.transmit(&other.encode());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(shared.ack_queue.len(), 0);
    }

    #[test]
    fn corrupt_frames_are_dropped() {
        let medium = MockMedium::new();
        let (shared, _rf) = spawn_receiver(&medium);
        let injector = medium.endpoint(MockTiming::default());

        let mut bytes = Frame::new(FrameType::Data, false, 17, 23, b"hello", 5, 0).encode();
        bytes[7] ^= 0xFF;
        injector.transmit(&bytes);

        thread::sleep(Duration::from_millis(100));
        assert!(shared.recv_queue.is_empty());
        // no ACK went out either
        assert_eq!(medium.history().len(), 1);
    }

    #[test]
    fn beacon_advances_clock_monotonically() {
        let medium = MockMedium::new();
        let (shared, rf) = spawn_receiver(&medium);
        let injector = medium.endpoint(MockTiming::default());

        rf.set_clock(1_000_000);
        assert_eq!(shared.local_clock(), 1_000_000);

        injector.transmit(&Frame::beacon(17, 1_005_000, 0).encode());
        assert!(wait_until(1000, || shared.local_clock() == 1_002_500));

        // a beacon behind our clock is ignored
        injector.transmit(&Frame::beacon(17, 999_000, 1).encode());
        thread::sleep(Duration::from_millis(100));
        assert_eq!(shared.local_clock(), 1_002_500);
    }
}
