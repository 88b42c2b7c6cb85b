use core::fmt;

use thiserror::Error;

/// Largest frame the device moves in either direction: 1500 byte MTU, 14 byte header, slack.
///
/// Receive paths read up to this many bytes too, so anything the transmit path accepts comes
/// back whole.
pub const MAX_FRAME_SIZE: usize = 1516;

/// Destination MAC + source MAC + EtherType.
pub const ETH_HEADER_LEN: usize = 14;

/// EtherType values up to this are IEEE 802.3 length fields, not protocol identifiers.
pub const MAX_LENGTH_FIELD: u16 = 1500;

const ETHER_TYPE_OFFSET: usize = 12;

/// A 48-bit Ethernet hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

/// Returned when a copy would run past [`MAX_FRAME_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("frame of {len} bytes exceeds the {max} byte limit")]
pub struct FrameTooLarge {
    pub len: usize,
    pub max: usize,
}

/// Fixed-capacity owned frame buffer with explicit length bookkeeping.
#[derive(Clone)]
pub struct FrameBuf {
    data: [u8; MAX_FRAME_SIZE],
    len: usize,
}

impl FrameBuf {
    pub fn new() -> Self {
        Self {
            data: [0; MAX_FRAME_SIZE],
            len: 0,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, FrameTooLarge> {
        let mut buf = Self::new();
        buf.extend_from_slice(bytes)?;
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        MAX_FRAME_SIZE
    }

    pub fn remaining(&self) -> usize {
        MAX_FRAME_SIZE - self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append `bytes`, failing without modifying the buffer if they do not fit.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), FrameTooLarge> {
        let end = self
            .len
            .checked_add(bytes.len())
            .filter(|&end| end <= MAX_FRAME_SIZE)
            .ok_or(FrameTooLarge {
                len: self.len.saturating_add(bytes.len()),
                max: MAX_FRAME_SIZE,
            })?;
        self.data[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    /// Replace the contents with whatever `fill` writes into the first `limit` bytes.
    ///
    /// `fill` returns the number of bytes it produced; values above `limit` are clamped.
    pub fn fill_with<E>(
        &mut self,
        limit: usize,
        fill: impl FnOnce(&mut [u8]) -> Result<usize, E>,
    ) -> Result<usize, E> {
        let limit = limit.min(MAX_FRAME_SIZE);
        self.len = 0;
        let n = fill(&mut self.data[..limit])?.min(limit);
        self.len = n;
        Ok(n)
    }

    /// The 14-byte Ethernet header, if the frame is at least that long.
    pub fn header(&self) -> Option<[u8; ETH_HEADER_LEN]> {
        self.as_slice()
            .get(..ETH_HEADER_LEN)
            .and_then(|h| h.try_into().ok())
    }

    pub fn ether_type(&self) -> Option<u16> {
        ether_type(self.as_slice())
    }
}

impl Default for FrameBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FrameBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuf").field("len", &self.len).finish()
    }
}

impl AsRef<[u8]> for FrameBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for FrameBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for FrameBuf {}

/// Big-endian type/length field at offset 12.
pub fn ether_type(frame: &[u8]) -> Option<u16> {
    let bytes = frame.get(ETHER_TYPE_OFFSET..ETHER_TYPE_OFFSET + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Normalize a type/length field into a protocol table key.
///
/// Length-framed (802.3) frames all share the catch-all key 0.
pub fn dispatch_key(ether_type: u16) -> u16 {
    if ether_type <= MAX_LENGTH_FIELD {
        0
    } else {
        ether_type
    }
}
