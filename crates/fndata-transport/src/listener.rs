use std::net::TcpListener;
#[cfg(unix)]
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
#[cfg(unix)]
use std::os::unix::net::UnixListener;
use std::path::Path;

use tracing::{debug, info};

use crate::descriptor::{ServiceAddress, ServiceDescriptor};
use crate::error::{Result, TransportError};
use crate::stream::DataStream;

/// Default permission mode for created socket paths.
pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

/// `sockaddr_un.sun_path` is 108 bytes on Linux, 104 on macOS and most BSDs.
#[cfg(target_os = "linux")]
const MAX_SOCKET_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_SOCKET_PATH_LEN: usize = 104;

/// Accepts data-plane connections on a Unix domain socket or TCP address.
pub struct TransportListener {
    inner: ListenerInner,
    descriptor: ServiceDescriptor,
}

enum ListenerInner {
    #[cfg(unix)]
    Unix(UnixSocketListener),
    Tcp(TcpListener),
}

impl TransportListener {
    /// Bind to the address named by `descriptor`.
    ///
    /// For TCP, port `0` picks a free port; [`Self::descriptor`] reports the
    /// address actually bound so it can be handed to connecting peers.
    pub fn bind(descriptor: &ServiceDescriptor) -> Result<Self> {
        match descriptor.address()? {
            ServiceAddress::Unix(path) => Self::bind_unix(&path, DEFAULT_SOCKET_MODE),
            ServiceAddress::Tcp(addr) => {
                let listener = TcpListener::bind(&addr).map_err(|e| TransportError::Bind {
                    address: addr.clone(),
                    source: e,
                })?;
                let local = listener.local_addr()?;
                info!(%local, "listening on tcp");
                Ok(Self {
                    inner: ListenerInner::Tcp(listener),
                    descriptor: ServiceDescriptor::tcp(local),
                })
            }
        }
    }

    #[cfg(unix)]
    fn bind_unix(path: &Path, mode: u32) -> Result<Self> {
        let listener = UnixSocketListener::bind(path, mode)?;
        Ok(Self {
            descriptor: ServiceDescriptor::unix(path),
            inner: ListenerInner::Unix(listener),
        })
    }

    #[cfg(not(unix))]
    fn bind_unix(path: &Path, _mode: u32) -> Result<Self> {
        Err(TransportError::Unsupported(path.display().to_string()))
    }

    /// Accept the next incoming connection (blocking).
    pub fn accept(&self) -> Result<DataStream> {
        match &self.inner {
            #[cfg(unix)]
            ListenerInner::Unix(listener) => listener.accept(),
            ListenerInner::Tcp(listener) => {
                let (stream, peer) = listener.accept().map_err(TransportError::Accept)?;
                debug!(%peer, "accepted tcp connection");
                Ok(DataStream::from_tcp(stream))
            }
        }
    }

    /// Descriptor connecting peers should use to reach this listener.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }
}

/// A bound filesystem-path Unix socket that removes its path on drop, but
/// only while the path still refers to the socket it created.
#[cfg(unix)]
struct UnixSocketListener {
    listener: UnixListener,
    path: std::path::PathBuf,
    identity: (u64, u64),
}

#[cfg(unix)]
impl UnixSocketListener {
    fn bind(path: &Path, mode: u32) -> Result<Self> {
        let len = path.as_os_str().len();
        if len >= MAX_SOCKET_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path: path.to_path_buf(),
                len,
                max: MAX_SOCKET_PATH_LEN,
            });
        }

        let bind_err = |source: std::io::Error| TransportError::Bind {
            address: path.display().to_string(),
            source,
        };

        remove_stale_socket(path).map_err(bind_err)?;
        let listener = UnixListener::bind(path).map_err(bind_err)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(bind_err)?;
        let identity = socket_identity(path).map_err(bind_err)?;

        info!(?path, "listening on unix domain socket");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            identity,
        })
    }

    fn accept(&self) -> Result<DataStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted unix connection");
        Ok(DataStream::from_unix(stream))
    }
}

#[cfg(unix)]
impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        match socket_identity(&self.path) {
            Ok(identity) if identity == self.identity => {
                debug!(path = ?self.path, "removing socket file");
                let _ = std::fs::remove_file(&self.path);
            }
            Ok(_) => debug!(path = ?self.path, "socket path replaced; leaving it in place"),
            Err(_) => {}
        }
    }
}

/// Remove a leftover socket at `path`. Anything that is not a socket is an error.
#[cfg(unix)]
fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !metadata.file_type().is_socket() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "existing path is not a unix socket",
        ));
    }
    debug!(?path, "removing stale socket");
    std::fs::remove_file(path)
}

/// `(dev, ino)` of the socket at `path`, or an error if it is not a socket.
#[cfg(unix)]
fn socket_identity(path: &Path) -> std::io::Result<(u64, u64)> {
    let metadata = std::fs::symlink_metadata(path)?;
    if !metadata.file_type().is_socket() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path is not a unix socket",
        ));
    }
    Ok((metadata.dev(), metadata.ino()))
}
