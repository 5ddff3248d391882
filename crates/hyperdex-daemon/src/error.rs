//! Daemon error types.

use thiserror::Error;

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Errors that can occur while running the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] hyperdex_config::ConfigParseError),

    #[error("disk error: {0}")]
    Disk(#[from] hyperdex_disk::DiskError),

    #[error("wire protocol error: {0}")]
    Wire(#[from] hyperdex_wire::WireError),

    #[error("could not install signal handlers: {0}")]
    Signals(std::io::Error),

    #[error("could not change to the data directory {0}")]
    DataDir(std::path::PathBuf),

    #[error("transport shut down")]
    Shutdown,
}
