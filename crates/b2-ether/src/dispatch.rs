use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::DispatchError;
use crate::guest::GuestHandler;

/// EtherType → guest handler map.
///
/// Key 0 is the catch-all for 802.3 length-framed packets (see
/// [`b2_net_backend::dispatch_key`]). At most one handler per key. Looked up by the reception
/// thread, mutated by driver calls.
#[derive(Debug, Default)]
pub struct ProtocolTable {
    handlers: RwLock<HashMap<u16, GuestHandler>>,
}

impl ProtocolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, ether_type: u16, handler: GuestHandler) -> Result<(), DispatchError> {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        if handlers.contains_key(&ether_type) {
            return Err(DispatchError::AlreadyAttached(ether_type));
        }
        handlers.insert(ether_type, handler);
        Ok(())
    }

    pub fn detach(&self, ether_type: u16) -> Result<(), DispatchError> {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers
            .remove(&ether_type)
            .map(|_| ())
            .ok_or(DispatchError::NotAttached(ether_type))
    }

    pub fn reset(&self) {
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    /// Handler for a dispatch key. A registered null handler is returned as-is; callers treat
    /// it as "drop".
    pub fn lookup(&self, key: u16) -> Option<GuestHandler> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
