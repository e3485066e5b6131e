//! Transmit worker: the five-state CSMA/CA FSM.
//!
//! The machine is an explicit state enumeration with one method per
//! state returning the next state, so each transition can be driven
//! and inspected in isolation from the worker loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use rand::Rng;

use crate::config::FRAME_ALIGN_MS;
use crate::frame::{Frame, BROADCAST_ADDR};
use crate::link::{wall_clock_ms, Shared};
use crate::rf::Rf;
use crate::status;

/// Transmitter FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxState {
    /// Idle: polling the send queue or generating a beacon.
    AwaitPacket,
    /// Channel was idle at pickup; DIFS then transmit.
    IdleDifsWait,
    /// Channel busy; wait it out, then DIFS, then slot backoff.
    BusyDifsWait,
    /// Counting down backoff slots while the channel stays idle.
    SlotWait,
    /// Unicast sent; waiting for the matching ACK.
    AwaitAck,
}

pub(crate) struct Transmitter<R> {
    shared: Arc<Shared<R>>,
    state: TxState,

    /// Frame currently being worked, with its encoded bytes.
    pending: Option<Frame>,
    pending_bytes: Vec<u8>,
    is_broadcast: bool,

    /// Contention window upper bound.
    cw: u32,
    /// Remaining backoff slots. Deliberately not reset between frames:
    /// the ACK timeout reuses whatever the last countdown left here.
    slot_count: u32,
    retries: u32,

    /// DIFS in ms: SIFS + 2 slots.
    difs_ms: u64,
}

impl<R: Rf> Transmitter<R> {
    pub(crate) fn new(shared: Arc<Shared<R>>) -> Self {
        let difs_ms = shared.rf.sifs_time() + 2 * shared.rf.slot_time();

        Self {
            shared,
            state: TxState::AwaitPacket,
            pending: None,
            pending_bytes: Vec::new(),
            is_broadcast: false,
            cw: 0,
            slot_count: 0,
            retries: 0,
            difs_ms,
        }
    }

    /// Worker loop. Exits once the shutdown flag is raised.
    pub(crate) fn run(mut self) {
        info!("transmitter started (DIFS {} ms)", self.difs_ms);

        while !self.shared.is_shutdown() {
            self.state = match self.state {
                TxState::AwaitPacket => self.await_packet(),
                TxState::IdleDifsWait => self.idle_difs_wait(),
                TxState::BusyDifsWait => self.busy_difs_wait(),
                TxState::SlotWait => self.slot_wait(),
                TxState::AwaitAck => self.await_ack(),
            };
        }

        info!("transmitter stopped");
    }

    /// Pick up the next frame: a due beacon takes priority over queued
    /// data, and an armed beacon timer bounds the queue wait so a
    /// beacon goes out on schedule even when no data arrives.
    fn await_packet(&mut self) -> TxState {
        let bytes = if self.shared.beacons_enabled() && self.shared.is_time_to_beacon() {
            self.shared.create_beacon().encode()
        } else if self.shared.beacons_enabled() {
            let timeout = Duration::from_millis(self.shared.beacon_interval_ms().max(0) as u64);

            match self.shared.send_queue.poll(timeout) {
                Some(bytes) => bytes,
                None if self.shared.is_shutdown() => return TxState::AwaitPacket,
                None => self.shared.create_beacon().encode(),
            }
        } else {
            match self.shared.send_queue.take() {
                Some(bytes) => bytes,
                None => return TxState::AwaitPacket,
            }
        };

        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("undersized frame on send queue, dropping: {:?}", e);
                return TxState::AwaitPacket;
            }
        };

        self.retries = 0;
        self.is_broadcast = frame.dest == BROADCAST_ADDR;
        self.cw = self.shared.rf.cw_min();
        self.pending = Some(frame);
        self.pending_bytes = bytes;

        if self.shared.debug_enabled() {
            debug!("starting collision window at [0..{}]", self.cw);
        }

        if !self.shared.rf.in_use() {
            if self.shared.debug_enabled() {
                trace!("moving to IDLE_DIFS_WAIT with pending frame");
            }
            TxState::IdleDifsWait
        } else {
            if self.shared.debug_enabled() {
                trace!("moving to BUSY_DIFS_WAIT with pending frame");
            }
            TxState::BusyDifsWait
        }
    }

    fn idle_difs_wait(&mut self) -> TxState {
        if !self.shared.rf.in_use() {
            self.sleep_difs();
        }

        if self.shared.rf.in_use() {
            return TxState::BusyDifsWait;
        }

        if self.shared.debug_enabled() {
            debug!(
                "transmitting after simple DIFS wait at {} ms",
                self.shared.local_clock()
            );
        }

        self.shared.transmit_on_rf(&self.pending_bytes);
        self.shared.record_transmission_time();

        self.after_transmit()
    }

    fn busy_difs_wait(&mut self) -> TxState {
        if self.shared.debug_enabled() {
            trace!("waiting for DIFS to elapse after current tx");
        }

        while self.shared.rf.in_use() {
            if self.shared.is_shutdown() {
                return TxState::BusyDifsWait;
            }
            self.sleep_difs();
        }

        self.slot_count = self.draw_slot();
        self.sleep_difs();

        if !self.shared.rf.in_use() {
            if self.shared.debug_enabled() {
                trace!("DIFS wait over, starting slot countdown ({})", self.slot_count);
            }
            TxState::SlotWait
        } else {
            TxState::BusyDifsWait
        }
    }

    fn slot_wait(&mut self) -> TxState {
        while self.slot_count > 0 {
            if self.shared.is_shutdown() {
                return TxState::SlotWait;
            }

            let next_boundary = FRAME_ALIGN_MS - wall_clock_ms() % FRAME_ALIGN_MS;
            let sleep_ms = next_boundary.min(self.shared.rf.slot_time() as i64);
            thread::sleep(Duration::from_millis(sleep_ms as u64));

            if self.shared.rf.in_use() {
                if self.shared.debug_enabled() {
                    trace!(
                        "slot countdown interrupted, back to BUSY_DIFS_WAIT ({} left)",
                        self.slot_count
                    );
                }
                return TxState::BusyDifsWait;
            }

            // The countdown only advances when the slot sleep was not
            // cut short by the alignment boundary.
            if next_boundary <= self.shared.rf.slot_time() as i64 {
                self.slot_count -= 1;
            }
        }

        if self.shared.rf.in_use() {
            return TxState::BusyDifsWait;
        }

        if self.shared.debug_enabled() {
            debug!(
                "transmitting after DIFS+slots wait at {} ms",
                self.shared.local_clock()
            );
        }

        self.shared.transmit_on_rf(&self.pending_bytes);

        if self.is_broadcast {
            self.shared.record_transmission_time();
        }

        self.after_transmit()
    }

    fn await_ack(&mut self) -> TxState {
        let timeout_ms = self.shared.rf.sifs_time()
            + self.shared.ack_tx_time.as_millis() as u64
            + self.slot_count as u64 * self.shared.rf.slot_time();
        let timeout = Duration::from_millis(timeout_ms);

        let started = Instant::now();
        let ack = self.shared.ack_queue.poll(timeout);

        let our_source = self
            .pending
            .as_ref()
            .map(|f| f.source)
            .unwrap_or(self.shared.our_mac);

        if let Some(ack) = &ack {
            if ack.dest == our_source {
                self.shared.set_status(status::TX_DELIVERED);

                if self.shared.debug_enabled() {
                    let early = timeout.saturating_sub(started.elapsed());
                    debug!("got a valid ACK: {}", ack);
                    debug!("ACK arrived {} ms before timeout", early.as_millis());
                    trace!("moving to AWAIT_PACKET after receiving valid ACK");
                }

                self.pending = None;
                return TxState::AwaitPacket;
            }
        }

        // Timed out, or an ACK that was not addressed to us: both take
        // the retransmission path.
        if self.shared.debug_enabled() {
            debug!("ACK timer expired at {} ms", self.shared.local_clock());
        }

        if self.retries < self.shared.rf.retry_limit() {
            if self.retries == 0 {
                self.cw = self.shared.rf.cw_min();
                if self.shared.debug_enabled() {
                    debug!("starting collision window at [0..{}]", self.cw);
                }
            } else {
                self.cw = (self.cw * 2).min(self.shared.rf.cw_max());
                if self.shared.debug_enabled() {
                    debug!("doubled collision window, now [0..{}]", self.cw);
                }
            }

            if let Some(frame) = self.pending.as_mut() {
                frame.retry = true;
                self.pending_bytes = frame.encode();
            }
            self.retries += 1;

            if self.shared.debug_enabled() {
                trace!(
                    "moving to BUSY_DIFS_WAIT after ACK timeout (slot count {})",
                    self.slot_count
                );
            }

            TxState::BusyDifsWait
        } else {
            warn!(
                "retry limit reached, dropping frame for {}",
                self.pending.as_ref().map(|f| f.dest).unwrap_or(0)
            );

            self.shared.set_status(status::TX_FAILED);
            self.pending = None;

            TxState::AwaitPacket
        }
    }

    fn after_transmit(&mut self) -> TxState {
        if self.is_broadcast {
            if self.shared.debug_enabled() {
                trace!("moving to AWAIT_PACKET after broadcast");
            }
            self.pending = None;
            TxState::AwaitPacket
        } else {
            if self.shared.debug_enabled() {
                trace!("moving to AWAIT_ACK after sending DATA");
            }
            TxState::AwaitAck
        }
    }

    /// Max-slot mode pins the draw to the window bound; otherwise the
    /// slot is uniform over `[0..CW]` inclusive.
    fn draw_slot(&self) -> u32 {
        if self.shared.max_slot_select() {
            self.cw
        } else {
            rand::thread_rng().gen_range(0..=self.cw)
        }
    }

    /// DIFS sleep aligned to the next 50 ms wall-clock boundary.
    fn sleep_difs(&self) {
        let next_boundary = FRAME_ALIGN_MS - wall_clock_ms() % FRAME_ALIGN_MS;
        thread::sleep(Duration::from_millis(next_boundary as u64 + self.difs_ms));
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::config::LinkConfig;
    use crate::frame::FrameType;
    use crate::rf::mock::{MockMedium, MockTiming};

    use super::*;

    fn test_config() -> LinkConfig {
        LinkConfig {
            ack_tx_time: Duration::from_millis(30),
            ..LinkConfig::default()
        }
    }

    fn transmitter(
        medium: &MockMedium,
        timing: MockTiming,
        config: LinkConfig,
    ) -> Transmitter<crate::rf::mock::MockRf> {
        let shared = Arc::new(Shared::new(17, medium.endpoint(timing), &config));
        Transmitter::new(shared)
    }

    fn load_pending(tx: &mut Transmitter<crate::rf::mock::MockRf>, dest: i16) {
        let frame = Frame::new(FrameType::Data, false, 17, dest, b"payload", 7, 0);
        tx.pending_bytes = frame.encode();
        tx.is_broadcast = frame.dest == BROADCAST_ADDR;
        tx.pending = Some(frame);
    }

    #[test]
    fn await_packet_picks_up_data_on_idle_channel() {
        let medium = MockMedium::new();
        let mut tx = transmitter(&medium, MockTiming::default(), test_config());

        let frame = Frame::new(FrameType::Data, false, 17, 23, b"hi", 2, 0);
        assert!(tx.shared.send_queue.offer(frame.encode()));

        assert_eq!(tx.await_packet(), TxState::IdleDifsWait);
        assert_eq!(tx.retries, 0);
        assert_eq!(tx.cw, 3);
        assert!(!tx.is_broadcast);
        assert_eq!(tx.pending.as_ref().unwrap().dest, 23);
    }

    #[test]
    fn await_packet_routes_to_busy_wait() {
        let medium = MockMedium::new();
        let mut tx = transmitter(&medium, MockTiming::default(), test_config());
        medium.set_busy(true);

        let frame = Frame::new(FrameType::Data, false, 17, BROADCAST_ADDR, b"x", 1, 0);
        assert!(tx.shared.send_queue.offer(frame.encode()));

        assert_eq!(tx.await_packet(), TxState::BusyDifsWait);
        assert!(tx.is_broadcast);
    }

    #[test]
    fn due_beacon_takes_priority_over_data() {
        let medium = MockMedium::new();
        let mut tx = transmitter(&medium, MockTiming::default(), test_config());

        tx.shared.enable_beacons(1);

        let frame = Frame::new(FrameType::Data, false, 17, 23, b"hi", 2, 0);
        assert!(tx.shared.send_queue.offer(frame.encode()));

        // interval elapsed long ago, so the beacon wins
        assert_eq!(tx.await_packet(), TxState::IdleDifsWait);
        assert_eq!(tx.pending.as_ref().unwrap().frame_type, FrameType::Beacon);
        assert!(tx.is_broadcast);
        assert_eq!(tx.shared.send_queue.len(), 1);
    }

    #[test]
    fn ack_for_us_completes_delivery() {
        let medium = MockMedium::new();
        let mut tx = transmitter(&medium, MockTiming::default(), test_config());
        load_pending(&mut tx, 23);

        let ack = Frame::new(FrameType::Ack, false, 23, 17, &[], 0, 0);
        assert!(tx.shared.ack_queue.offer(ack));

        assert_eq!(tx.await_ack(), TxState::AwaitPacket);
        assert_eq!(tx.shared.status.load(std::sync::atomic::Ordering::SeqCst), status::TX_DELIVERED);
        assert!(tx.pending.is_none());
    }

    #[test]
    fn mismatched_ack_takes_retry_path() {
        let medium = MockMedium::new();
        let mut tx = transmitter(&medium, MockTiming::default(), test_config());
        load_pending(&mut tx, 23);
        tx.cw = 3;

        // ACK destined for some other station
        let ack = Frame::new(FrameType::Ack, false, 23, 99, &[], 0, 0);
        assert!(tx.shared.ack_queue.offer(ack));

        assert_eq!(tx.await_ack(), TxState::BusyDifsWait);
        assert_eq!(tx.retries, 1);
        assert!(tx.pending.as_ref().unwrap().retry);
    }

    #[test]
    fn backoff_window_follows_doubling_law() {
        let medium = MockMedium::new();
        let timing = MockTiming {
            sifs_time: 5,
            slot_time: 10,
            retry_limit: 8,
        };
        let mut tx = transmitter(&medium, timing, test_config());
        load_pending(&mut tx, 23);
        tx.cw = 3;

        let mut windows = Vec::new();
        for _ in 0..6 {
            assert_eq!(tx.await_ack(), TxState::BusyDifsWait);
            windows.push(tx.cw);
        }

        // reset on first retry, then doubling capped at aCWmax
        assert_eq!(windows, vec![3, 6, 12, 24, 31, 31]);

        // retransmitted bytes carry the retry bit
        let rebuilt = Frame::decode(&tx.pending_bytes).unwrap();
        assert!(rebuilt.retry);
        assert_eq!(rebuilt.seq, 0);
    }

    #[test]
    fn retry_exhaustion_reports_tx_failed() {
        let medium = MockMedium::new();
        let timing = MockTiming {
            sifs_time: 5,
            slot_time: 10,
            retry_limit: 2,
        };
        let mut tx = transmitter(&medium, timing, test_config());
        load_pending(&mut tx, 23);
        tx.cw = 3;

        assert_eq!(tx.await_ack(), TxState::BusyDifsWait);
        assert_eq!(tx.await_ack(), TxState::BusyDifsWait);
        assert_eq!(tx.await_ack(), TxState::AwaitPacket);

        assert_eq!(tx.shared.status.load(std::sync::atomic::Ordering::SeqCst), status::TX_FAILED);
        assert!(tx.pending.is_none());
    }

    #[test]
    fn max_slot_mode_pins_the_draw() {
        let medium = MockMedium::new();
        let mut tx = transmitter(&medium, MockTiming::default(), test_config());

        tx.shared.set_max_slot_select(true);
        tx.cw = 31;
        assert_eq!(tx.draw_slot(), 31);

        tx.shared.set_max_slot_select(false);
        for _ in 0..32 {
            assert!(tx.draw_slot() <= 31);
        }
    }
}
