
use core::fmt;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::FrameError;

/// Control word + addressing overhead (6 bytes) plus the trailing FCS (4 bytes).
pub const FRAME_OVERHEAD: usize = 10;

/// Largest payload a single frame may carry (frame <= 2048 bytes).
pub const MAX_PAYLOAD_LEN: usize = 2038;

/// Destination address carried by broadcast frames (0xFFFF on the wire).
pub const BROADCAST_ADDR: i16 = -1;

/// Frame check sequence, the same 32-bit ANSI X3.66 CRC used by zlib
/// and the Ethernet FCS (aka CRC-32/ISO-HDLC).
const FCS: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Frame type carried in the top three bits of the control word.
///
/// CTS and RTS are reserved by the frame format but never generated
/// or acted on by this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Ack,
    Beacon,
    Cts,
    Rts,
    /// Unassigned type bits, carried through so receivers can drop them.
    Unknown(u8),
}

impl FrameType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => FrameType::Data,
            1 => FrameType::Ack,
            2 => FrameType::Beacon,
            4 => FrameType::Cts,
            5 => FrameType::Rts,
            b => FrameType::Unknown(b),
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            FrameType::Data => 0,
            FrameType::Ack => 1,
            FrameType::Beacon => 2,
            FrameType::Cts => 4,
            FrameType::Rts => 5,
            FrameType::Unknown(b) => *b & 0x07,
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Data => write!(f, "DATA"),
            FrameType::Ack => write!(f, "ACK"),
            FrameType::Beacon => write!(f, "BEACON"),
            FrameType::Cts => write!(f, "CTS"),
            FrameType::Rts => write!(f, "RTS"),
            FrameType::Unknown(_) => write!(f, "UNKNOWN"),
        }
    }
}

/// A parsed link-layer frame with owned payload storage.
///
/// Wire layout is `10 + |payload|` bytes:
/// control word (type / retry / sequence), destination MAC, source MAC,
/// payload, FCS. All multi-byte fields are big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub retry: bool,
    /// 12-bit sequence number, wraps modulo 4096.
    pub seq: u16,
    pub dest: i16,
    pub source: i16,
    payload: Vec<u8>,
    /// Result of the FCS comparison on decode; always true for frames
    /// built locally.
    pub crc_ok: bool,
}

impl Frame {
    /// Build a frame for transmission. `len` is clamped to the payload
    /// buffer so callers may hand over a larger scratch buffer.
    pub fn new(
        frame_type: FrameType,
        retry: bool,
        source: i16,
        dest: i16,
        payload: &[u8],
        len: usize,
        seq: u16,
    ) -> Self {
        let len = len.min(payload.len());

        Self {
            frame_type,
            retry,
            seq: seq & 0x0FFF,
            dest,
            source,
            payload: payload[..len].to_vec(),
            crc_ok: true,
        }
    }

    /// Build the ACK for a received frame: addresses swapped, same
    /// sequence number, empty payload.
    pub fn ack_for(frame: &Frame) -> Self {
        Self::new(FrameType::Ack, false, frame.dest, frame.source, &[], 0, frame.seq)
    }

    /// Build a broadcast beacon carrying `timestamp_ms` as its 8-byte
    /// big-endian payload.
    pub fn beacon(source: i16, timestamp_ms: i64, seq: u16) -> Self {
        let ts = timestamp_to_bytes(timestamp_ms);
        Self::new(FrameType::Beacon, false, source, BROADCAST_ADDR, &ts, ts.len(), seq)
    }

    /// Serialize to wire bytes, appending the FCS.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.body_bytes();

        let fcs = FCS.checksum(&buf);
        buf.extend_from_slice(&fcs.to_be_bytes());

        buf
    }

    /// CRC-32 over the frame's current header and payload.
    pub fn fcs(&self) -> u32 {
        FCS.checksum(&self.body_bytes())
    }

    /// Everything the FCS covers: control word, addressing, payload.
    fn body_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + FRAME_OVERHEAD);

        let control = ((self.frame_type.bits() as u16) << 13)
            | ((self.retry as u16) << 12)
            | (self.seq & 0x0FFF);

        buf.extend_from_slice(&control.to_be_bytes());
        buf.extend_from_slice(&(self.dest as u16).to_be_bytes());
        buf.extend_from_slice(&(self.source as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Parse wire bytes. The only structural failure is a buffer too
    /// short to hold the fixed overhead; a frame whose FCS does not
    /// match is returned with `crc_ok = false` for the caller to drop.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < FRAME_OVERHEAD {
            return Err(FrameError::Truncated(buf.len()));
        }

        let control = u16::from_be_bytes([buf[0], buf[1]]);
        let frame_type = FrameType::from_bits((control >> 13) as u8);
        let retry = (control >> 12) & 0x01 == 1;
        let seq = control & 0x0FFF;

        let dest = u16::from_be_bytes([buf[2], buf[3]]) as i16;
        let source = u16::from_be_bytes([buf[4], buf[5]]) as i16;

        let fcs_at = buf.len() - 4;
        let payload = buf[6..fcs_at].to_vec();

        let stored = u32::from_be_bytes([buf[fcs_at], buf[fcs_at + 1], buf[fcs_at + 2], buf[fcs_at + 3]]);
        let crc_ok = FCS.checksum(&buf[..fcs_at]) == stored;

        Ok(Self {
            frame_type,
            retry,
            seq,
            dest,
            source,
            payload,
            crc_ok,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Beacon timestamp, if this frame carries one.
    pub fn timestamp(&self) -> Option<i64> {
        if self.frame_type == FrameType::Beacon && self.payload.len() == 8 {
            Some(bytes_to_timestamp(&self.payload))
        } else {
            None
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{} {} {} {} -> {} [",
            self.frame_type, self.retry as u8, self.seq, self.source, self.dest
        )?;

        match self.frame_type {
            FrameType::Beacon => {
                if let Some(ts) = self.timestamp() {
                    write!(f, "\"{}\"", ts)?;
                }
            }
            FrameType::Data if !self.payload.is_empty() => {
                write!(f, "\"{}\"", String::from_utf8_lossy(&self.payload))?;
            }
            _ => (),
        }

        write!(f, "] ({})>", self.fcs())
    }
}

/// Encode a millisecond timestamp as 8 bytes, most significant first.
pub fn timestamp_to_bytes(time_ms: i64) -> [u8; 8] {
    time_ms.to_be_bytes()
}

/// Inverse of [`timestamp_to_bytes`]. Extra bytes beyond the first 8
/// are ignored.
pub fn bytes_to_timestamp(buf: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);
    i64::from_be_bytes(raw)
}
