use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur in data-plane transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The descriptor URL could not be interpreted as an address.
    #[error("invalid service descriptor '{url}': {reason}")]
    InvalidDescriptor { url: String, reason: String },

    /// Failed to bind to the specified address.
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    /// Connecting did not finish within the configured timeout.
    #[error("timed out connecting to {address} after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The address family is not available on this platform.
    #[error("unsupported address {0} on this platform")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
