//! Wire frame codec.
//!
//! A frame is a 2-byte big-endian total length (counting itself),
//! an 8-byte seconds and 8-byte microseconds timestamp, then payload.
//! All functions here are pure transformations over byte buffers;
//! the event loop and the benchmark loop own the I/O.

use bytes::{Buf, BufMut, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bytes of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Bytes of the full header: length prefix + seconds + microseconds.
/// Also the minimum legal frame length.
pub const HEADER_LEN: usize = 18;

/// Maximum legal frame length (the prefix is a u16).
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Wall-clock timestamp carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub secs: u64,
    pub micros: u64,
}

impl Timestamp {
    /// Current time as seconds/microseconds since the Unix epoch.
    /// A clock before the epoch yields the zero timestamp.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: elapsed.as_secs(),
            micros: u64::from(elapsed.subsec_micros()),
        }
    }
}

/// Frame codec errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Payload would push the total length past the u16 prefix.
    PayloadTooLarge(usize),
    /// Declared length below the header size.
    BadDeclaredLength(u16),
    /// Declared length does not match the buffered byte count.
    LengthMismatch { declared: u16, actual: usize },
    /// Fewer bytes than a full header.
    Truncated(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::PayloadTooLarge(len) => {
                write!(f, "payload of {len} bytes exceeds the maximum frame size")
            }
            FrameError::BadDeclaredLength(declared) => {
                write!(f, "declared frame length {declared} is below the header size")
            }
            FrameError::LengthMismatch { declared, actual } => {
                write!(f, "declared frame length {declared} but {actual} bytes present")
            }
            FrameError::Truncated(len) => {
                write!(f, "{len} bytes is shorter than a frame header")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode a frame with the given timestamp and payload.
///
/// Fails if the total length would not fit the 2-byte prefix.
pub fn encode(timestamp: Timestamp, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let total = HEADER_LEN + payload.len();
    if total > MAX_FRAME_LEN {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u16(total as u16);
    buf.put_u64(timestamp.secs);
    buf.put_u64(timestamp.micros);
    buf.put_slice(payload);
    Ok(buf.to_vec())
}

/// Extract the declared total length once the prefix has arrived.
///
/// Returns `None` while fewer than 2 bytes are buffered; the prefix
/// itself may be split across deliveries.
pub fn try_extract_header(buf: &[u8]) -> Option<u16> {
    if buf.len() < LENGTH_PREFIX_LEN {
        return None;
    }
    Some(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Whether the buffered byte count equals the declared total length.
pub fn is_complete(buf: &[u8], declared: u16) -> bool {
    buf.len() == usize::from(declared)
}

/// Read the header timestamp once a full header is buffered.
pub fn peek_timestamp(buf: &[u8]) -> Option<Timestamp> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let mut cur = &buf[LENGTH_PREFIX_LEN..HEADER_LEN];
    Some(Timestamp {
        secs: cur.get_u64(),
        micros: cur.get_u64(),
    })
}

/// Decode a complete frame, validating well-formedness.
pub fn decode(frame: &[u8]) -> Result<(Timestamp, &[u8]), FrameError> {
    if frame.len() < HEADER_LEN {
        return Err(FrameError::Truncated(frame.len()));
    }

    let mut cur = frame;
    let declared = cur.get_u16();
    if usize::from(declared) < HEADER_LEN {
        return Err(FrameError::BadDeclaredLength(declared));
    }
    if usize::from(declared) != frame.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: frame.len(),
        });
    }

    let timestamp = Timestamp {
        secs: cur.get_u64(),
        micros: cur.get_u64(),
    };
    Ok((timestamp, &frame[HEADER_LEN..]))
}
