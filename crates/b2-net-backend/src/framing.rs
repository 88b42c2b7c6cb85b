//! Length-prefixed records used on the guest → NAT channel.
//!
//! Each record is a 4-byte host-native-endian length followed by that many frame bytes, sent as
//! one datagram. Both ends live in the same process, so native endianness is sufficient.

use thiserror::Error;

use crate::frame::{FrameBuf, MAX_FRAME_SIZE};

pub const RECORD_HEADER_LEN: usize = 4;

/// Receive buffer size that holds any valid record plus one byte, so an over-long datagram is
/// never mistaken for a valid one after truncation.
pub const MAX_RECORD_LEN: usize = RECORD_HEADER_LEN + MAX_FRAME_SIZE + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordError {
    /// The length prefix is larger than any frame the transmit path can produce.
    #[error("record length {len} exceeds the {max} byte frame limit")]
    TooLarge { len: usize, max: usize },

    #[error("record declares {declared} frame bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("record of {len} bytes is shorter than its header")]
    Truncated { len: usize },
}

/// Encode `frame` as a single record so it can be sent in one datagram.
pub fn encode_record(frame: &[u8]) -> Vec<u8> {
    let len = u32::try_from(frame.len()).unwrap_or(u32::MAX);
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + frame.len());
    record.extend_from_slice(&len.to_ne_bytes());
    record.extend_from_slice(frame);
    record
}

/// Decode one received record into `buf`. `buf` is left empty on error.
pub fn decode_record(record: &[u8], buf: &mut FrameBuf) -> Result<(), RecordError> {
    buf.clear();
    let Some((header, body)) = record.split_first_chunk::<RECORD_HEADER_LEN>() else {
        return Err(RecordError::Truncated { len: record.len() });
    };
    let len = u32::from_ne_bytes(*header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RecordError::TooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }
    if body.len() != len {
        return Err(RecordError::LengthMismatch {
            declared: len,
            actual: body.len(),
        });
    }
    buf.extend_from_slice(body)
        .map_err(|err| RecordError::TooLarge {
            len: err.len,
            max: err.max,
        })
}
