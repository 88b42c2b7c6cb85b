//! Thin wrappers over the few syscalls std does not expose: `poll(2)`, `fcntl(2)` and the
//! network driver ioctls.
#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

/// Driver ioctls understood by `sheep_net` and ethertap devices.
#[cfg(target_os = "linux")]
mod request {
    /// Descriptors that are not network character devices treat the argument as a
    /// `struct ifreq`; the scratch buffer is sized so such a driver never runs off its end.
    pub const ARG_BUF_LEN: usize = 64;

    pub const SIOCGIFADDR: u64 = 0x8915;
    pub const SIOCADDMULTI: u64 = 0x8931;
    pub const SIOCDELMULTI: u64 = 0x8932;
}

fn timeout_ms(timeout: Duration) -> libc::c_int {
    timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
}

/// `poll(2)` over `fds`. Returns the number of descriptors with events; an interrupted call is
/// reported as zero ready descriptors.
pub fn poll(fds: &mut [libc::pollfd], timeout: Duration) -> io::Result<usize> {
    // SAFETY: `fds` is a valid, exclusively borrowed slice of `pollfd` for the whole call.
    let res = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms(timeout)) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(res as usize)
}

/// Wait up to `timeout` for `fd` to become readable.
///
/// A hang-up or error condition without pending data is reported as
/// [`io::ErrorKind::BrokenPipe`] so callers do not spin on a dead descriptor.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    let mut fds = [libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    }];
    if poll(&mut fds, timeout)? == 0 {
        return Ok(false);
    }
    let revents = fds[0].revents;
    if revents & libc::POLLIN != 0 {
        return Ok(true);
    }
    if revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("descriptor reported poll events {revents:#x}"),
        ));
    }
    Ok(false)
}

pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor kept alive by the borrow.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Make writes to a closed pipe or socket fail with `EPIPE` instead of killing the process.
///
/// An embedder that installed its own `SIGPIPE` handler keeps it.
pub fn ignore_sigpipe() -> io::Result<()> {
    // SAFETY: `sigaction` structs are plain data; zeroed is a valid initial state and both
    // pointers reference locals that outlive the calls.
    unsafe {
        let mut current: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGPIPE, std::ptr::null(), &mut current) != 0 {
            return Err(io::Error::last_os_error());
        }
        if current.sa_sigaction != libc::SIG_DFL {
            return Ok(());
        }
        let mut ignore: libc::sigaction = std::mem::zeroed();
        ignore.sa_sigaction = libc::SIG_IGN;
        libc::sigfillset(&mut ignore.sa_mask);
        if libc::sigaction(libc::SIGPIPE, &ignore, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Ask the network driver behind `fd` for its Ethernet address.
#[cfg(target_os = "linux")]
pub fn hardware_address(fd: BorrowedFd<'_>) -> io::Result<[u8; 6]> {
    let mut arg = [0u8; request::ARG_BUF_LEN];
    // SAFETY: the driver writes at most `ARG_BUF_LEN` bytes into the buffer we own.
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request::SIOCGIFADDR as _, arg.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut addr = [0u8; 6];
    addr.copy_from_slice(&arg[..6]);
    Ok(addr)
}

#[cfg(target_os = "linux")]
pub fn add_multicast(fd: BorrowedFd<'_>, addr: &[u8; 6]) -> io::Result<()> {
    multicast_ioctl(fd, request::SIOCADDMULTI, addr)
}

#[cfg(target_os = "linux")]
pub fn del_multicast(fd: BorrowedFd<'_>, addr: &[u8; 6]) -> io::Result<()> {
    multicast_ioctl(fd, request::SIOCDELMULTI, addr)
}

#[cfg(target_os = "linux")]
fn multicast_ioctl(fd: BorrowedFd<'_>, req: u64, addr: &[u8; 6]) -> io::Result<()> {
    let mut arg = [0u8; request::ARG_BUF_LEN];
    arg[..6].copy_from_slice(addr);
    // SAFETY: the driver reads at most `ARG_BUF_LEN` bytes from the buffer we own.
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), req as _, arg.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn hardware_address(_fd: BorrowedFd<'_>) -> io::Result<[u8; 6]> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(not(target_os = "linux"))]
pub fn add_multicast(_fd: BorrowedFd<'_>, _addr: &[u8; 6]) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(not(target_os = "linux"))]
pub fn del_multicast(_fd: BorrowedFd<'_>, _addr: &[u8; 6]) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}
