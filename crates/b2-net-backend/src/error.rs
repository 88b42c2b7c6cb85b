use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while acquiring a host transport.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("cannot open network device {path}: {source}")]
    OpenDevice {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot switch network descriptor to non-blocking I/O: {0}")]
    NonBlocking(#[source] io::Error),

    #[error("cannot bind UDP tunnel socket on port {port}: {source}")]
    BindTunnel {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("cannot create NAT pipe: {0}")]
    Pipe(#[source] io::Error),
}
