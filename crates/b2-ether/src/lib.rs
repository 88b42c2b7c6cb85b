//! Emulated Ethernet device bridging a guest OS to a host network transport.
//!
//! Frames arrive on a dedicated reception thread, which looks up the guest protocol handler
//! for the frame's EtherType, raises the Ethernet interrupt and waits for the guest to service
//! it before reading the next frame. Guest transmits go straight to the transport from the
//! calling thread.
//!
//! The host transport is one of a raw network device, a UDP tunnel, or the NAT pump from
//! [`b2_net_pump`].
#![forbid(unsafe_code)]

mod bridge;
mod config;
mod device;
mod dispatch;
mod driver;
mod error;
mod guest;
mod rx;
mod stats;
mod tx;

pub use bridge::{BridgeClosed, Delivery, InterruptBridge};
pub use config::{ConfigLoadError, EtherConfig};
pub use device::{EtherDevice, EtherHost, FALLBACK_MAC, NAT_MAC};
pub use dispatch::ProtocolTable;
pub use driver::EtherDriver;
pub use error::{
    status, status_of, DispatchError, InitError, MulticastError, StatusCode, TxError,
};
pub use guest::{
    Alerts, GuestCpu, GuestHandler, GuestPacket, GuestRxLayout, GuestSegment, HandlerRegs,
    LogAlerts,
};
pub use rx::RX_WAIT;
pub use stats::EtherStats;

pub use b2_net_backend::{MacAddr, Transport, TransportKind, TransportSelector};
pub use b2_net_pump::{LoopbackStack, RedirectRule, UserNetStack};
