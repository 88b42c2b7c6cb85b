use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use b2_net_backend::{TransportSelector, DEFAULT_UDP_PORT};
use b2_net_pump::{parse_redirects, ConfigError, RedirectRule};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Network preferences.
///
/// Field names follow the emulator's preference keys. Absent fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EtherConfig {
    /// Transport selector: `slirp`, `udp`, `tapN` / `ethertapN`, or anything else for
    /// `sheep_net`. `None` leaves networking off.
    pub ether: Option<String>,
    /// NAT host forwarding rules, `<proto>:<host_port>:<guest_address>:<guest_port>`.
    pub redir: Vec<String>,
    /// Tunnel Ethernet over UDP regardless of `ether`.
    pub udptunnel: bool,
    pub udpport: u16,
    pub nonet: bool,
}

impl Default for EtherConfig {
    fn default() -> Self {
        Self {
            ether: None,
            redir: Vec::new(),
            udptunnel: false,
            udpport: DEFAULT_UDP_PORT,
            nonet: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read network config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid network config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl EtherConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The transport to open, or `None` when networking is off.
    pub fn transport(&self) -> Option<TransportSelector> {
        if self.nonet {
            return None;
        }
        if self.udptunnel {
            return Some(TransportSelector::Udp { port: self.udpport });
        }
        let name = self.ether.as_deref()?;
        match TransportSelector::parse(name) {
            TransportSelector::Udp { .. } => Some(TransportSelector::Udp { port: self.udpport }),
            selector => Some(selector),
        }
    }

    /// Parse `redir`, keeping the valid rules.
    pub fn redirects(&self) -> (Vec<RedirectRule>, Vec<ConfigError>) {
        parse_redirects(&self.redir)
    }
}
