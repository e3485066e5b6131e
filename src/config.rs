
use std::time::Duration;

/// Capacity of every link-layer queue (send, receive, ACK).
pub const QUEUE_CAPACITY: usize = 10;

/// Admission gate on the send queue: a fifth undelivered frame is
/// refused with `TX_FAILED`.
pub const SEND_QUEUE_LIMIT: usize = 4;

/// Admission gate on the receive queue for unicast DATA. Broadcast
/// frames bypass it.
pub const RECV_QUEUE_LIMIT: usize = 4;

/// Time on air of an ACK frame in ms, calibrated against the RF
/// simulator. Feeds the ACK wait timeout.
pub const ACK_TX_TIME_MS: i64 = 1113;

/// Added to outgoing beacon timestamps to cover the sender-side
/// encode-and-transmit latency.
pub const SENDER_FUDGE_FACTOR_MS: i64 = 2100;

/// Subtracted from incoming beacon timestamps to cover the
/// receive-and-decode latency.
pub const RECV_FUDGE_FACTOR_MS: i64 = 2500;

/// Transmissions are aligned to wall-clock boundaries of this many ms.
pub const FRAME_ALIGN_MS: i64 = 50;

/// Configuration for the link layer.
///
/// Everything here can also be changed at runtime through the command
/// surface; the config only sets the initial state. Beacons start
/// disabled and are armed with command 3.
#[derive(Clone, PartialEq, Debug)]
pub struct LinkConfig {
    /// Emit per-transition debug output.
    pub debug: bool,

    /// Always draw the maximum backoff slot instead of a random one.
    pub max_slot_select: bool,

    /// ACK time-on-air used in the ACK wait timeout.
    pub ack_tx_time: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            debug: false,
            max_slot_select: false,
            ack_tx_time: Duration::from_millis(ACK_TX_TIME_MS as u64),
        }
    }
}
