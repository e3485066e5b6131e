//! WLAN crate prelude
//
// https://github.com/rust-iot/rust-wlan

pub use crate::{status, Transmission};

pub use crate::config::LinkConfig;

pub use crate::error::FrameError;

pub use crate::frame::{Frame, FrameType, BROADCAST_ADDR, MAX_PAYLOAD_LEN};

pub use crate::link::LinkLayer;

pub use crate::queue::BoundedQueue;

pub use crate::rf::Rf;

#[cfg(feature = "mocks")]
pub use crate::rf::mock::{MockMedium, MockRf, MockTiming};
