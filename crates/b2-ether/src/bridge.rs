//! Rendezvous between the reception thread and the guest's interrupt service.
//!
//! The reception thread publishes one [`Delivery`], raises the interrupt and blocks until the
//! guest acknowledges it. There is never more than one outstanding interrupt.

use std::net::SocketAddr;
use std::sync::{Condvar, Mutex, MutexGuard};

use b2_net_backend::{FrameBuf, ETH_HEADER_LEN};
use thiserror::Error;

use crate::guest::GuestHandler;

/// A received frame waiting for the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Run `handler` on the frame. `header` is the scratch copy destined for the read header
    /// area.
    Dispatch {
        handler: GuestHandler,
        ether_type: u16,
        header: [u8; ETH_HEADER_LEN],
        frame: FrameBuf,
    },
    /// Frame from a UDP tunnel peer; bypasses the protocol table.
    Tunnel { frame: FrameBuf, from: SocketAddr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupt bridge closed")]
pub struct BridgeClosed;

#[derive(Debug, Default)]
struct State {
    pending: bool,
    delivery: Option<Delivery>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct InterruptBridge {
    state: Mutex<State>,
    acked: Condvar,
}

impl InterruptBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Idle → Pending, publishing `delivery` for [`InterruptBridge::take_delivery`].
    pub fn raise(&self, delivery: Delivery) -> Result<(), BridgeClosed> {
        let mut state = self.lock();
        if state.closed {
            return Err(BridgeClosed);
        }
        debug_assert!(!state.pending, "interrupt raised while one is outstanding");
        state.pending = true;
        state.delivery = Some(delivery);
        Ok(())
    }

    /// Claim the published delivery. `None` for a spurious or repeated service call.
    pub fn take_delivery(&self) -> Option<Delivery> {
        let mut state = self.lock();
        if !state.pending {
            return None;
        }
        state.delivery.take()
    }

    /// Pending → Idle, waking the reception thread. Returns `false` (and changes nothing) when
    /// no interrupt was outstanding.
    pub fn acknowledge(&self) -> bool {
        let mut state = self.lock();
        if !state.pending {
            return false;
        }
        state.pending = false;
        state.delivery = None;
        self.acked.notify_all();
        true
    }

    /// Block until the outstanding interrupt is acknowledged or the bridge is closed.
    pub fn wait_ack(&self) -> Result<(), BridgeClosed> {
        let mut state = self.lock();
        while state.pending && !state.closed {
            state = self.acked.wait(state).unwrap_or_else(|p| p.into_inner());
        }
        if state.pending {
            return Err(BridgeClosed);
        }
        Ok(())
    }

    /// Release any waiter and refuse further interrupts. Idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.acked.notify_all();
    }

    pub fn is_pending(&self) -> bool {
        self.lock().pending
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
