use std::io;

use b2_net_backend::BackendError;
use b2_net_pump::PumpError;
use thiserror::Error;

/// Guest-visible result codes returned by the driver entry points.
pub mod status {
    pub const NO_ERR: i16 = 0;
    pub const E_MULTI_ERR: i16 = -91;
    pub const E_LEN_ERR: i16 = -92;
    pub const LAP_PROT_ERR: i16 = -94;
    pub const EXCESS_COLLSNS: i16 = -95;
}

/// Failure to bring the device up. Everything acquired before the failure has been released.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("no network transport configured")]
    NoTransport,

    #[error(transparent)]
    Transport(#[from] BackendError),

    #[error("the slirp transport needs a user-mode network stack, none was supplied")]
    NatStackMissing,

    #[error("cannot start NAT pump: {0}")]
    Pump(#[from] PumpError),

    #[error("cannot start Ethernet reception thread: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("protocol type {0:#06x} already has a handler")]
    AlreadyAttached(u16),

    #[error("protocol type {0:#06x} has no handler")]
    NotAttached(u16),
}

#[derive(Debug, Error)]
pub enum TxError {
    #[error("packet of {len} bytes exceeds the {max} byte frame limit")]
    TooLong { len: usize, max: usize },

    #[error("transmit failed: {0}")]
    Backend(#[source] io::Error),

    #[error("network device is closed")]
    Closed,
}

#[derive(Debug, Error)]
#[error("cannot update multicast filter: {0}")]
pub struct MulticastError(#[source] pub io::Error);

/// Collapse a driver call result into the guest's status code.
pub fn status_of<E: StatusCode>(res: &Result<(), E>) -> i16 {
    match res {
        Ok(()) => status::NO_ERR,
        Err(err) => err.status(),
    }
}

/// Errors the guest sees as a numeric status.
pub trait StatusCode {
    fn status(&self) -> i16;
}

impl StatusCode for DispatchError {
    fn status(&self) -> i16 {
        status::LAP_PROT_ERR
    }
}

impl StatusCode for TxError {
    fn status(&self) -> i16 {
        match self {
            TxError::TooLong { .. } => status::E_LEN_ERR,
            TxError::Backend(_) | TxError::Closed => status::EXCESS_COLLSNS,
        }
    }
}

impl StatusCode for MulticastError {
    fn status(&self) -> i16 {
        status::E_MULTI_ERR
    }
}
