use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, TransportError};

const UNIX_SCHEME: &str = "unix://";
const UNIX_PREFIX: &str = "unix:";
const TCP_SCHEME: &str = "tcp://";

/// A resolved transport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceAddress {
    /// Filesystem path of a Unix domain socket.
    Unix(PathBuf),
    /// `host:port` of a TCP endpoint.
    Tcp(String),
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceAddress::Unix(path) => write!(f, "{UNIX_SCHEME}{}", path.display()),
            ServiceAddress::Tcp(addr) => write!(f, "{TCP_SCHEME}{addr}"),
        }
    }
}

/// Names the remote data service a physical connection is opened to.
///
/// Two descriptors denote the same connection exactly when their URLs are
/// equal. Accepted forms:
///
/// - `unix:///abs/path.sock`, `unix:relative.sock`, `/abs/path.sock`
/// - `tcp://host:port`, `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceDescriptor {
    url: String,
}

impl ServiceDescriptor {
    /// Create a descriptor from its URL. Parsing is deferred to [`Self::address`].
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Descriptor for a Unix domain socket path.
    pub fn unix(path: impl AsRef<Path>) -> Self {
        Self::new(format!("{UNIX_SCHEME}{}", path.as_ref().display()))
    }

    /// Descriptor for a TCP `host:port`.
    pub fn tcp(addr: impl fmt::Display) -> Self {
        Self::new(format!("{TCP_SCHEME}{addr}"))
    }

    /// The descriptor URL as given.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Parse the URL into a transport address.
    pub fn address(&self) -> Result<ServiceAddress> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(self.invalid("empty descriptor"));
        }

        if let Some(path) = url.strip_prefix(UNIX_SCHEME) {
            return self.unix_address(path);
        }
        if let Some(path) = url.strip_prefix(UNIX_PREFIX) {
            return self.unix_address(path);
        }
        if let Some(addr) = url.strip_prefix(TCP_SCHEME) {
            return self.tcp_address(addr);
        }
        if url.starts_with('/') {
            return self.unix_address(url);
        }
        if url.contains("://") {
            return Err(self.invalid("unsupported scheme"));
        }
        self.tcp_address(url)
    }

    fn unix_address(&self, path: &str) -> Result<ServiceAddress> {
        if path.is_empty() {
            return Err(self.invalid("missing socket path"));
        }
        Ok(ServiceAddress::Unix(PathBuf::from(path)))
    }

    fn tcp_address(&self, addr: &str) -> Result<ServiceAddress> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| self.invalid("expected host:port"))?;
        if host.is_empty() {
            return Err(self.invalid("missing host"));
        }
        port.parse::<u16>()
            .map_err(|_| self.invalid(&format!("invalid port '{port}'")))?;
        Ok(ServiceAddress::Tcp(addr.to_string()))
    }

    fn invalid(&self, reason: &str) -> TransportError {
        TransportError::InvalidDescriptor {
            url: self.url.clone(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

impl From<&str> for ServiceDescriptor {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for ServiceDescriptor {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}
