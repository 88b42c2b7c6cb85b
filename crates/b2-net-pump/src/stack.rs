use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use thiserror::Error;

use crate::redirect::RedirectRule;

/// Receives frames the stack emits towards the guest.
pub trait FrameSink {
    fn emit(&mut self, frame: &[u8]);
}

impl FrameSink for Vec<Vec<u8>> {
    fn emit(&mut self, frame: &[u8]) {
        self.push(frame.to_vec());
    }
}

#[derive(Debug, Error)]
pub enum StackError {
    #[error("user-mode network stack failed to initialize: {0}")]
    Init(String),

    #[error("could not install host forwarding rule {rule}: {reason}")]
    Redirect { rule: RedirectRule, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Interface to an embedded user-mode TCP/IP stack driven by the NAT pump.
///
/// The pump owns the stack on its own thread, so implementations only need to be [`Send`].
/// Each pump iteration calls [`UserNetStack::fill_poll_set`], polls the registered descriptors,
/// then calls [`UserNetStack::poll_complete`] with the results.
pub trait UserNetStack: Send {
    fn init(&mut self) -> Result<(), StackError> {
        Ok(())
    }

    fn add_redirect(&mut self, rule: &RedirectRule) -> Result<(), StackError>;

    /// Ingest one Ethernet frame sent by the guest.
    fn input(&mut self, frame: &[u8], out: &mut dyn FrameSink);

    /// Register the descriptors the stack wants polled and return how long it is willing to
    /// wait for them.
    fn fill_poll_set(&mut self, set: &mut PollSet) -> Duration;

    fn poll_complete(&mut self, set: &PollSet, out: &mut dyn FrameSink);
}

impl<T: UserNetStack + ?Sized> UserNetStack for Box<T> {
    fn init(&mut self) -> Result<(), StackError> {
        (**self).init()
    }

    fn add_redirect(&mut self, rule: &RedirectRule) -> Result<(), StackError> {
        (**self).add_redirect(rule)
    }

    fn input(&mut self, frame: &[u8], out: &mut dyn FrameSink) {
        (**self).input(frame, out)
    }

    fn fill_poll_set(&mut self, set: &mut PollSet) -> Duration {
        (**self).fill_poll_set(set)
    }

    fn poll_complete(&mut self, set: &PollSet, out: &mut dyn FrameSink) {
        (**self).poll_complete(set, out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    fn events(self) -> libc::c_short {
        let mut events = 0;
        if self.readable {
            events |= libc::POLLIN;
        }
        if self.writable {
            events |= libc::POLLOUT;
        }
        events
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Hang-up, error or invalid descriptor.
    pub error: bool,
}

/// Handle returned by [`PollSet::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollToken(usize);

/// The descriptor set handed to `poll(2)` on each pump iteration.
///
/// Rebuilt from scratch every iteration; tokens are only valid until the next
/// [`PollSet::clear`].
#[derive(Debug, Default)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fd: RawFd, interest: Interest) -> PollToken {
        self.fds.push(libc::pollfd {
            fd,
            events: interest.events(),
            revents: 0,
        });
        PollToken(self.fds.len() - 1)
    }

    pub fn readiness(&self, token: PollToken) -> Readiness {
        let Some(entry) = self.fds.get(token.0) else {
            return Readiness::default();
        };
        let revents = entry.revents;
        Readiness {
            readable: revents & libc::POLLIN != 0,
            writable: revents & libc::POLLOUT != 0,
            error: revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0,
        }
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    pub(crate) fn poll(&mut self, timeout: Duration) -> io::Result<usize> {
        b2_net_backend::sys::poll(&mut self.fds, timeout)
    }
}
