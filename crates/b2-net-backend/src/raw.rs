use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::error::BackendError;
use crate::frame::{FrameBuf, MacAddr, MAX_FRAME_SIZE};
use crate::sys;

/// Which host driver sits behind a [`RawDevice`]. The drivers differ only in how they treat
/// multicast filter failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawDeviceKind {
    SheepNet,
    Ethertap,
}

/// A raw network character device opened for non-blocking reads and writes.
#[derive(Debug)]
pub struct RawDevice {
    file: File,
    kind: RawDeviceKind,
}

impl RawDevice {
    pub fn open(path: &Path, kind: RawDeviceKind) -> Result<Self, BackendError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| BackendError::OpenDevice {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self { file, kind })
    }

    /// Wrap a descriptor the host already opened. The descriptor is switched to non-blocking
    /// mode.
    pub fn from_fd(fd: OwnedFd, kind: RawDeviceKind) -> Result<Self, BackendError> {
        sys::set_nonblocking(fd.as_fd()).map_err(BackendError::NonBlocking)?;
        Ok(Self {
            file: File::from(fd),
            kind,
        })
    }

    pub fn kind(&self) -> RawDeviceKind {
        self.kind
    }

    /// Read one frame. `Ok(0)` and `WouldBlock` both mean "nothing to deliver".
    pub fn read_frame(&self, buf: &mut FrameBuf) -> io::Result<usize> {
        buf.fill_with(MAX_FRAME_SIZE, |dst| (&self.file).read(dst))
    }

    pub fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let written = (&self.file).write(frame)?;
        if written != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write to network device ({written} of {} bytes)", frame.len()),
            ));
        }
        Ok(())
    }

    pub fn hardware_address(&self) -> io::Result<MacAddr> {
        sys::hardware_address(self.file.as_fd()).map(MacAddr)
    }

    pub fn add_multicast(&self, addr: MacAddr) -> io::Result<()> {
        sys::add_multicast(self.file.as_fd(), &addr.0)
    }

    pub fn remove_multicast(&self, addr: MacAddr) -> io::Result<()> {
        sys::del_multicast(self.file.as_fd(), &addr.0)
    }
}

impl AsFd for RawDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}
