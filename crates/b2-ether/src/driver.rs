use b2_net_backend::MacAddr;

use crate::config::EtherConfig;
use crate::device::{EtherDevice, EtherHost, FALLBACK_MAC};
use crate::error::{status, status_of, InitError};
use crate::guest::{GuestHandler, GuestPacket};
use crate::stats::EtherStats;

/// Guest driver entry points, returning guest status codes.
///
/// Never fails to initialize: with networking disabled, unconfigured, or failing to open, the
/// driver stays closed and every entry point is a harmless no-op.
#[derive(Debug, Default)]
pub struct EtherDriver {
    device: Option<EtherDevice>,
}

impl EtherDriver {
    pub fn init(config: &EtherConfig, host: EtherHost) -> Self {
        if config.nonet {
            tracing::info!("networking disabled");
            return Self::default();
        }
        match EtherDevice::open(config, host) {
            Ok(device) => Self {
                device: Some(device),
            },
            Err(InitError::NoTransport) => {
                tracing::info!("no Ethernet device configured");
                Self::default()
            }
            Err(err) => {
                tracing::warn!("Ethernet unavailable: {err}");
                Self::default()
            }
        }
    }

    pub fn from_device(device: EtherDevice) -> Self {
        Self {
            device: Some(device),
        }
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn hardware_address(&self) -> MacAddr {
        self.device
            .as_ref()
            .map_or(FALLBACK_MAC, EtherDevice::hardware_address)
    }

    /// Protocol handlers can only be registered with an open device; a closed driver accepts
    /// and forgets them.
    pub fn attach(&self, ether_type: u16, handler: GuestHandler) -> i16 {
        match &self.device {
            Some(device) => status_of(&device.attach(ether_type, handler)),
            None => status::NO_ERR,
        }
    }

    pub fn detach(&self, ether_type: u16) -> i16 {
        match &self.device {
            Some(device) => status_of(&device.detach(ether_type)),
            None => status::NO_ERR,
        }
    }

    pub fn reset(&self) {
        if let Some(device) = &self.device {
            device.reset();
        }
    }

    pub fn transmit(&self, packet: &GuestPacket) -> i16 {
        match &self.device {
            Some(device) => status_of(&device.transmit(packet)),
            None => status::NO_ERR,
        }
    }

    pub fn add_multicast(&self, addr: MacAddr) -> i16 {
        match &self.device {
            Some(device) => status_of(&device.add_multicast(addr)),
            None => status::NO_ERR,
        }
    }

    pub fn remove_multicast(&self, addr: MacAddr) -> i16 {
        match &self.device {
            Some(device) => status_of(&device.remove_multicast(addr)),
            None => status::NO_ERR,
        }
    }

    pub fn service_interrupt(&self) {
        if let Some(device) = &self.device {
            device.service_interrupt();
        }
    }

    pub fn stats(&self) -> Option<EtherStats> {
        self.device.as_ref().map(EtherDevice::stats)
    }

    /// Shut the device down and return to the closed state.
    pub fn exit(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.shutdown();
        }
    }
}
