//! Simplified 802.11 ("802.11~") link layer library.
//! Provides CSMA/CA medium access, ACK/retransmission and
//! beacon-driven clock synchronization over a virtual RF medium.
//
// https://github.com/rust-iot/rust-wlan

use core::fmt;

pub mod config;

pub mod error;

pub mod frame;

pub mod queue;

pub mod rf;

pub mod link;

mod receive;
mod transmit;

pub mod prelude;

pub use crate::config::LinkConfig;
pub use crate::frame::{Frame, FrameType, BROADCAST_ADDR};
pub use crate::link::LinkLayer;
pub use crate::rf::Rf;

/// Status codes published through [`LinkLayer::status`].
///
/// Other values are reserved; readers should tolerate them.
pub mod status {
    /// Nothing has happened yet.
    pub const INIT: i32 = 0;
    /// A datagram reached the upper layer.
    pub const RX_OK: i32 = 1;
    /// The last unicast was acknowledged.
    pub const TX_DELIVERED: i32 = 4;
    /// The last send was dropped: backpressure or retry exhaustion.
    pub const TX_FAILED: i32 = 5;
}

/// An inbound datagram: payload and addressing, filled by
/// [`LinkLayer::recv`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub source_addr: i16,
    pub dest_addr: i16,
    pub buf: Vec<u8>,
}

impl fmt::Display for Transmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes, {} -> {}",
            self.buf.len(),
            self.source_addr,
            self.dest_addr
        )
    }
}
