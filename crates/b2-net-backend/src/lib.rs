//! Host transports for the emulated Ethernet device.
//!
//! This crate deals exclusively with raw Ethernet frames and the host descriptors they travel
//! over: a raw network character device (`sheep_net` / ethertap), a UDP tunnel socket, or the
//! device side of the pipe pair connecting the device to the NAT pump.
//!
//! Every transport is readiness-polled and non-blocking so the reception loop driving it stays
//! cancellable. The only `unsafe` code lives in [`sys`] (`poll(2)` and the driver ioctls).
#![deny(unsafe_code)]

pub mod error;
pub mod frame;
pub mod framing;
pub mod nat;
pub mod raw;
pub mod sys;
pub mod transport;
pub mod udp;

pub use error::BackendError;
pub use frame::{
    dispatch_key, ether_type, FrameBuf, FrameTooLarge, MacAddr, ETH_HEADER_LEN, MAX_FRAME_SIZE,
    MAX_LENGTH_FIELD,
};
pub use framing::{decode_record, encode_record, RecordError, MAX_RECORD_LEN, RECORD_HEADER_LEN};
pub use nat::{NatChannels, NatPipe, NatPumpChannels};
pub use raw::{RawDevice, RawDeviceKind};
pub use transport::{
    Backend, FrameSource, Transport, TransportKind, TransportSelector, TransportStats,
    DEFAULT_UDP_PORT,
};
pub use udp::UdpTunnel;
