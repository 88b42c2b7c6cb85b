//! Channels between the device and the NAT pump.
//!
//! Both directions are non-blocking datagram socket pairs, one frame per datagram:
//! - guest → NAT carries length-prefixed records (see [`crate::framing`]);
//! - NAT → guest carries bare frames, so the reception loop reads NAT output exactly like
//!   frames from a raw device.
//!
//! A datagram is queued whole or not at all, so a full channel fails one transmit without
//! desynchronizing later ones.

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixDatagram;

use crate::error::BackendError;
use crate::frame::{FrameBuf, MAX_FRAME_SIZE};
use crate::framing::encode_record;

/// Constructor for a connected device / pump channel pair.
pub struct NatChannels;

impl NatChannels {
    pub fn new() -> Result<(NatPipe, NatPumpChannels), BackendError> {
        let (to_pump, from_guest) = UnixDatagram::pair().map_err(BackendError::Pipe)?;
        let (to_guest, from_pump) = UnixDatagram::pair().map_err(BackendError::Pipe)?;

        for socket in [&to_pump, &from_guest, &to_guest, &from_pump] {
            socket
                .set_nonblocking(true)
                .map_err(BackendError::NonBlocking)?;
        }

        Ok((
            NatPipe { to_pump, from_pump },
            NatPumpChannels {
                from_guest,
                to_guest,
            },
        ))
    }
}

/// Device side of the NAT channels.
#[derive(Debug)]
pub struct NatPipe {
    to_pump: UnixDatagram,
    from_pump: UnixDatagram,
}

impl NatPipe {
    pub fn read_frame(&self, buf: &mut FrameBuf) -> io::Result<usize> {
        buf.fill_with(MAX_FRAME_SIZE, |dst| self.from_pump.recv(dst))
    }

    /// Queue `frame` for the pump. Fails with `WouldBlock` while the pump is behind.
    pub fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        debug_assert!(frame.len() <= MAX_FRAME_SIZE);

        let record = encode_record(frame);
        let sent = self.to_pump.send(&record)?;
        if sent != record.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("NAT input channel took {sent} of {} bytes", record.len()),
            ));
        }
        Ok(())
    }
}

impl AsFd for NatPipe {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.from_pump.as_fd()
    }
}

/// Pump side of the NAT channels. Both sockets are non-blocking.
#[derive(Debug)]
pub struct NatPumpChannels {
    /// Length-prefixed guest frames, one record per datagram.
    pub from_guest: UnixDatagram,
    /// Unframed NAT output. A full queue drops the frame.
    pub to_guest: UnixDatagram,
}
