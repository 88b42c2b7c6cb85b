use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::BackendError;
use crate::frame::{FrameBuf, MacAddr, ETH_HEADER_LEN};
use crate::nat::{NatChannels, NatPipe, NatPumpChannels};
use crate::raw::{RawDevice, RawDeviceKind};
use crate::sys;
use crate::udp::UdpTunnel;

/// Port used by UDP tunnels when the configuration does not name one.
pub const DEFAULT_UDP_PORT: u16 = 6066;

/// Selector string that chooses the NAT backend.
pub const NAT_SELECTOR: &str = "slirp";

/// Parsed form of the configured transport selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSelector {
    /// `/dev/sheep_net`; any selector that is not recognized otherwise.
    SheepNet,
    /// `/dev/<name>` for `tapN` / `ethertapN`.
    Ethertap(String),
    Udp { port: u16 },
    Nat,
}

impl TransportSelector {
    pub fn parse(name: &str) -> Self {
        let name = name.trim();
        if name == NAT_SELECTOR {
            Self::Nat
        } else if name == "udp" {
            Self::Udp {
                port: DEFAULT_UDP_PORT,
            }
        } else if name.starts_with("tap") || name.starts_with("ethertap") {
            Self::Ethertap(name.to_string())
        } else {
            Self::SheepNet
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::SheepNet | Self::Ethertap(_) => TransportKind::RawDevice,
            Self::Udp { .. } => TransportKind::UdpTunnel,
            Self::Nat => TransportKind::Nat,
        }
    }

    /// Character device backing a raw selector.
    pub fn device_path(&self) -> Option<PathBuf> {
        match self {
            Self::SheepNet => Some(PathBuf::from("/dev/sheep_net")),
            Self::Ethertap(name) => Some(PathBuf::from(format!("/dev/{name}"))),
            Self::Udp { .. } | Self::Nat => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    RawDevice,
    UdpTunnel,
    Nat,
}

/// Where a received frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    Device,
    /// UDP tunnel peer.
    Tunnel(SocketAddr),
}

/// The host endpoint behind a [`Transport`].
#[derive(Debug)]
pub enum Backend {
    RawDevice(RawDevice),
    UdpTunnel(UdpTunnel),
    NatPipe(NatPipe),
}

impl Backend {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Backend::RawDevice(dev) => dev.as_fd(),
            Backend::UdpTunnel(tunnel) => tunnel.as_fd(),
            Backend::NatPipe(pipe) => pipe.as_fd(),
        }
    }
}

/// Snapshot of [`Transport`] counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    pub rx_frames: u64,
    pub rx_bytes: u64,
    /// Frames shorter than an Ethernet header, discarded on read.
    pub rx_runts: u64,
    pub rx_errors: u64,
    pub tx_frames: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    rx_frames: AtomicU64,
    rx_bytes: AtomicU64,
    rx_runts: AtomicU64,
    rx_errors: AtomicU64,
    tx_frames: AtomicU64,
    tx_bytes: AtomicU64,
    tx_errors: AtomicU64,
}

/// The single host transport a device uses for its whole lifetime.
///
/// All methods take `&self`: the reception loop reads while the guest transmits from its own
/// thread. Dropping the transport closes its descriptors.
#[derive(Debug)]
pub struct Transport {
    backend: Backend,
    counters: Counters,
}

impl Transport {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            counters: Counters::default(),
        }
    }

    /// Acquire the transport named by `selector`.
    ///
    /// For [`TransportSelector::Nat`] the pump side of the channels is returned as well; the
    /// caller hands it to the NAT pump.
    pub fn open(
        selector: &TransportSelector,
    ) -> Result<(Self, Option<NatPumpChannels>), BackendError> {
        match selector {
            TransportSelector::SheepNet | TransportSelector::Ethertap(_) => {
                let kind = match selector {
                    TransportSelector::Ethertap(_) => RawDeviceKind::Ethertap,
                    _ => RawDeviceKind::SheepNet,
                };
                let path = selector
                    .device_path()
                    .unwrap_or_else(|| PathBuf::from("/dev/sheep_net"));
                let dev = RawDevice::open(&path, kind)?;
                tracing::info!(path = %path.display(), "opened raw network device");
                Ok((Self::new(Backend::RawDevice(dev)), None))
            }
            TransportSelector::Udp { port } => {
                let tunnel = UdpTunnel::bind(*port)?;
                tracing::info!(port = tunnel.port(), "opened UDP tunnel");
                Ok((Self::new(Backend::UdpTunnel(tunnel)), None))
            }
            TransportSelector::Nat => {
                let (pipe, pump) = NatChannels::new()?;
                Ok((Self::new(Backend::NatPipe(pipe)), Some(pump)))
            }
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn kind(&self) -> TransportKind {
        match self.backend {
            Backend::RawDevice(_) => TransportKind::RawDevice,
            Backend::UdpTunnel(_) => TransportKind::UdpTunnel,
            Backend::NatPipe(_) => TransportKind::Nat,
        }
    }

    /// Bounded wait for a frame to become readable.
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        sys::wait_readable(self.backend.as_fd(), timeout)
    }

    /// Read one frame without blocking.
    ///
    /// Returns `Ok(None)` when nothing is pending or when the frame was shorter than an Ethernet
    /// header (such frames are discarded, never surfaced).
    pub fn read_frame(&self, buf: &mut FrameBuf) -> io::Result<Option<FrameSource>> {
        let res = match &self.backend {
            Backend::RawDevice(dev) => dev.read_frame(buf).map(|n| (n, FrameSource::Device)),
            Backend::NatPipe(pipe) => pipe.read_frame(buf).map(|n| (n, FrameSource::Device)),
            Backend::UdpTunnel(tunnel) => tunnel
                .read_frame(buf)
                .map(|(n, from)| (n, FrameSource::Tunnel(from))),
        };

        let (n, source) = match res {
            Ok(ok) => ok,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(err) => {
                self.counters.rx_errors.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        if n < ETH_HEADER_LEN {
            self.counters.rx_runts.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(len = n, "discarding runt frame");
            buf.clear();
            return Ok(None);
        }

        self.counters.rx_frames.fetch_add(1, Ordering::Relaxed);
        self.counters.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
        Ok(Some(source))
    }

    pub fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let res = match &self.backend {
            Backend::RawDevice(dev) => dev.write_frame(frame),
            Backend::UdpTunnel(tunnel) => tunnel.write_frame(frame),
            Backend::NatPipe(pipe) => pipe.write_frame(frame),
        };
        match &res {
            Ok(()) => {
                self.counters.tx_frames.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .tx_bytes
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.tx_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        res
    }

    /// Add `addr` to the host-side multicast filter. Tunnels and NAT receive everything
    /// addressed to them, so only raw devices have a filter to program.
    pub fn add_multicast(&self, addr: MacAddr) -> io::Result<()> {
        match &self.backend {
            Backend::RawDevice(dev) => dev.add_multicast(addr),
            Backend::UdpTunnel(_) | Backend::NatPipe(_) => Ok(()),
        }
    }

    pub fn remove_multicast(&self, addr: MacAddr) -> io::Result<()> {
        match &self.backend {
            Backend::RawDevice(dev) => dev.remove_multicast(addr),
            Backend::UdpTunnel(_) | Backend::NatPipe(_) => Ok(()),
        }
    }

    /// Address reported by the host side, if it has one of its own.
    ///
    /// NAT mode has no host address; the device synthesizes one.
    pub fn hardware_address(&self) -> Option<io::Result<MacAddr>> {
        match &self.backend {
            Backend::RawDevice(dev) => Some(dev.hardware_address()),
            Backend::UdpTunnel(tunnel) => Some(Ok(tunnel.hardware_address())),
            Backend::NatPipe(_) => None,
        }
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            rx_frames: c.rx_frames.load(Ordering::Relaxed),
            rx_bytes: c.rx_bytes.load(Ordering::Relaxed),
            rx_runts: c.rx_runts.load(Ordering::Relaxed),
            rx_errors: c.rx_errors.load(Ordering::Relaxed),
            tx_frames: c.tx_frames.load(Ordering::Relaxed),
            tx_bytes: c.tx_bytes.load(Ordering::Relaxed),
            tx_errors: c.tx_errors.load(Ordering::Relaxed),
        }
    }
}
