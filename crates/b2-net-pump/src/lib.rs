//! NAT pump: drives an embedded user-mode TCP/IP stack on its own thread.
//!
//! The device writes guest frames as length-prefixed records into the guest → NAT stream; the
//! pump feeds them to a [`UserNetStack`], services the stack's host sockets, and writes
//! whatever the stack emits back to the device one datagram per frame.
//!
//! The stack itself is supplied by the host through the [`UserNetStack`] trait.
//! [`LoopbackStack`] is a trivial implementation that reflects every frame.
#![forbid(unsafe_code)]

mod loopback;
mod pump;
mod redirect;
mod stack;

pub use loopback::LoopbackStack;
pub use pump::{NatPump, PumpError, PumpStats, DEFAULT_MAX_WAIT};
pub use redirect::{
    parse_redirects, ConfigError, RedirectProtocol, RedirectRule, DEFAULT_GUEST_ADDR,
};
pub use stack::{
    FrameSink, Interest, PollSet, PollToken, Readiness, StackError, UserNetStack,
};
