//! Interfaces to the emulated machine.
//!
//! The device never touches guest memory or guest code directly; it goes through [`GuestCpu`],
//! which the emulator implements.

use std::net::SocketAddr;

use b2_net_backend::{FrameBuf, FrameTooLarge, ETH_HEADER_LEN};

/// Guest address of a protocol handler routine. Zero is the null handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GuestHandler(pub u32);

impl GuestHandler {
    pub const NULL: GuestHandler = GuestHandler(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Register values a protocol handler is entered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandlerRegs {
    /// Raw type/length field of the frame.
    pub d0: u32,
    /// Bytes after the Ethernet header.
    pub d1: u32,
    /// Packet data after the header.
    pub a0: u32,
    /// Read header area, just past the copied header.
    pub a3: u32,
    /// `ReadPacket` routine.
    pub a4: u32,
}

/// Fixed guest addresses used on the receive side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuestRxLayout {
    /// Buffer received frames are copied into before the handler runs.
    pub packet_buffer: u32,
    /// Read header area: receives the 14-byte header.
    pub rha: u32,
    /// `ReadPacket` / `ReadRest` routine handed to handlers.
    pub read_packet: u32,
}

impl GuestRxLayout {
    pub fn handler_regs(&self, ether_type: u16, frame_len: usize) -> HandlerRegs {
        let header = ETH_HEADER_LEN as u32;
        HandlerRegs {
            d0: u32::from(ether_type),
            d1: (frame_len as u32).saturating_sub(header),
            a0: self.packet_buffer.wrapping_add(header),
            a3: self.rha.wrapping_add(header),
            a4: self.read_packet,
        }
    }
}

/// The emulated CPU and memory, as seen by the device.
///
/// `raise_interrupt` is called from the reception thread; everything else from the thread
/// servicing the interrupt or issuing the driver call.
pub trait GuestCpu: Send + Sync {
    /// Flag the Ethernet interrupt. The emulator later calls
    /// [`crate::EtherDevice::service_interrupt`] from the guest's context.
    fn raise_interrupt(&self);

    fn read_guest_memory(&self, addr: u32, buf: &mut [u8]);

    fn write_guest_memory(&self, addr: u32, data: &[u8]);

    /// Run a guest protocol handler to completion.
    fn invoke_guest_handler(&self, handler: GuestHandler, regs: &HandlerRegs);

    /// Hand a frame received over the UDP tunnel to the guest side of the tunnel.
    fn udp_tunnel_read(&self, frame: &[u8], from: SocketAddr);
}

/// User-facing warning sink.
pub trait Alerts: Send + Sync {
    fn warning(&self, message: &str);
}

/// [`Alerts`] implementation that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlerts;

impl Alerts for LogAlerts {
    fn warning(&self, message: &str) {
        tracing::warn!("{message}");
    }
}

/// One contiguous piece of an outgoing packet in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestSegment {
    pub addr: u32,
    pub len: u16,
}

/// An outgoing packet as described by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestPacket {
    Linear { addr: u32, len: usize },
    Segments(Vec<GuestSegment>),
    /// Write data structure: big-endian `{u16 length, u32 pointer}` entries ending at a zero
    /// length.
    Wds(u32),
}

const WDS_ENTRY_LEN: u32 = 6;

impl GuestPacket {
    /// Copy the packet out of guest memory.
    pub fn gather(&self, cpu: &dyn GuestCpu) -> Result<FrameBuf, FrameTooLarge> {
        let mut frame = FrameBuf::new();
        match self {
            GuestPacket::Linear { addr, len } => {
                copy_segment(cpu, &mut frame, *addr, *len)?;
            }
            GuestPacket::Segments(segments) => {
                for seg in segments {
                    copy_segment(cpu, &mut frame, seg.addr, usize::from(seg.len))?;
                }
            }
            GuestPacket::Wds(mut entry) => loop {
                let mut raw = [0u8; WDS_ENTRY_LEN as usize];
                cpu.read_guest_memory(entry, &mut raw);
                let len = u16::from_be_bytes([raw[0], raw[1]]);
                if len == 0 {
                    break;
                }
                let ptr = u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]);
                copy_segment(cpu, &mut frame, ptr, usize::from(len))?;
                entry = entry.wrapping_add(WDS_ENTRY_LEN);
            },
        }
        Ok(frame)
    }
}

fn copy_segment(
    cpu: &dyn GuestCpu,
    frame: &mut FrameBuf,
    addr: u32,
    len: usize,
) -> Result<(), FrameTooLarge> {
    if len > frame.remaining() {
        return Err(FrameTooLarge {
            len: frame.len().saturating_add(len),
            max: frame.capacity(),
        });
    }
    let mut chunk = vec![0u8; len];
    cpu.read_guest_memory(addr, &mut chunk);
    frame.extend_from_slice(&chunk)
}
