use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::{AsFd, BorrowedFd};

use crate::error::BackendError;
use crate::frame::{FrameBuf, MacAddr, MAX_FRAME_SIZE};

/// Ethernet frames carried as UDP datagrams between emulator instances on a LAN.
///
/// Every instance uses the same port. A peer's hardware address is `'B' '2'` followed by its
/// IPv4 address, so unicast frames can be routed straight to the owning host; everything else
/// is broadcast.
#[derive(Debug)]
pub struct UdpTunnel {
    socket: UdpSocket,
    port: u16,
    local_ip: Ipv4Addr,
}

const TUNNEL_MAC_PREFIX: [u8; 2] = [b'B', b'2'];

impl UdpTunnel {
    pub fn bind(port: u16) -> Result<Self, BackendError> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
            .map_err(|source| BackendError::BindTunnel { port, source })?;
        let local_ip = probe_local_ip(port).unwrap_or(Ipv4Addr::UNSPECIFIED);
        Self::from_socket(socket, local_ip)
    }

    /// Wrap a socket the host already bound. `local_ip` is the address peers reach us on.
    pub fn from_socket(socket: UdpSocket, local_ip: Ipv4Addr) -> Result<Self, BackendError> {
        socket
            .set_nonblocking(true)
            .map_err(BackendError::NonBlocking)?;
        let port = socket
            .local_addr()
            .map_err(BackendError::NonBlocking)?
            .port();
        if let Err(err) = socket.set_broadcast(true) {
            tracing::warn!("UDP tunnel cannot enable broadcast: {err}");
        }
        Ok(Self {
            socket,
            port,
            local_ip,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn hardware_address(&self) -> MacAddr {
        mac_for_ip(self.local_ip)
    }

    /// Receive one datagram. Returns the payload length and the sender.
    pub fn read_frame(&self, buf: &mut FrameBuf) -> io::Result<(usize, SocketAddr)> {
        let mut from = None;
        let n = buf.fill_with(MAX_FRAME_SIZE, |dst| {
            let (n, addr) = self.socket.recv_from(dst)?;
            from = Some(addr);
            Ok::<_, io::Error>(n)
        })?;
        let from = from.ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        Ok((n, from))
    }

    pub fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let dest = self.destination(frame);
        let sent = self.socket.send_to(frame, dest)?;
        if sent != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short UDP tunnel send ({sent} of {} bytes)", frame.len()),
            ));
        }
        Ok(())
    }

    fn destination(&self, frame: &[u8]) -> SocketAddrV4 {
        match frame.get(..6) {
            Some([b0, b1, a, b, c, d]) if [*b0, *b1] == TUNNEL_MAC_PREFIX => {
                SocketAddrV4::new(Ipv4Addr::new(*a, *b, *c, *d), self.port)
            }
            _ => SocketAddrV4::new(Ipv4Addr::BROADCAST, self.port),
        }
    }
}

impl AsFd for UdpTunnel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

pub(crate) fn mac_for_ip(ip: Ipv4Addr) -> MacAddr {
    let [a, b, c, d] = ip.octets();
    MacAddr([TUNNEL_MAC_PREFIX[0], TUNNEL_MAC_PREFIX[1], a, b, c, d])
}

/// Find the address of the interface broadcasts on `port` would leave through. Connecting a UDP
/// socket sends nothing.
fn probe_local_ip(port: u16) -> io::Result<Ipv4Addr> {
    let probe = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    probe.set_broadcast(true)?;
    probe.connect(SocketAddrV4::new(Ipv4Addr::BROADCAST, port))?;
    match probe.local_addr()? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(_) => Err(io::Error::from(io::ErrorKind::AddrNotAvailable)),
    }
}
