use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::descriptor::{ServiceAddress, ServiceDescriptor};
use crate::error::{Result, TransportError};

/// A connected, bidirectional byte stream to a data-plane peer.
///
/// One `DataStream` backs one physical multiplexed connection. It is cloned
/// once so that a reader thread and the (mutex-guarded) writer can own a
/// handle each.
pub struct DataStream {
    inner: DataStreamInner,
}

enum DataStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    Tcp(TcpStream),
}

impl Read for DataStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            DataStreamInner::Unix(stream) => stream.read(buf),
            DataStreamInner::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for DataStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            DataStreamInner::Unix(stream) => stream.write(buf),
            DataStreamInner::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            DataStreamInner::Unix(stream) => stream.flush(),
            DataStreamInner::Tcp(stream) => stream.flush(),
        }
    }
}

impl DataStream {
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: DataStreamInner::Unix(stream),
        }
    }

    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        // Chunks are written whole; Nagle only adds latency.
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%err, "failed to disable nagle on tcp stream");
        }
        Self {
            inner: DataStreamInner::Tcp(stream),
        }
    }

    /// Both halves of a connected Unix socket pair. Mostly useful in tests.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            DataStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            DataStreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            DataStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            DataStreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Clone the handle (new file descriptor, same connection).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            DataStreamInner::Unix(stream) => Ok(Self::from_unix(stream.try_clone()?)),
            DataStreamInner::Tcp(stream) => Ok(Self {
                inner: DataStreamInner::Tcp(stream.try_clone()?),
            }),
        }
    }

    /// Shut down both directions. Unblocks a reader parked in `read`.
    pub fn shutdown(&self) -> Result<()> {
        let result = match &self.inner {
            #[cfg(unix)]
            DataStreamInner::Unix(stream) => stream.shutdown(Shutdown::Both),
            DataStreamInner::Tcp(stream) => stream.shutdown(Shutdown::Both),
        };
        match result {
            Ok(()) => Ok(()),
            // Already disconnected by the peer.
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            #[cfg(unix)]
            DataStreamInner::Unix(_) => "unix-domain-socket",
            DataStreamInner::Tcp(_) => "tcp",
        }
    }
}

impl std::fmt::Debug for DataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStream")
            .field("type", &self.transport_name())
            .finish()
    }
}

/// Open a stream to the service named by `descriptor`.
///
/// `timeout` bounds TCP connection establishment per resolved address.
/// Unix domain socket connects either succeed or fail immediately.
pub fn connect(descriptor: &ServiceDescriptor, timeout: Option<Duration>) -> Result<DataStream> {
    match descriptor.address()? {
        ServiceAddress::Unix(path) => connect_unix(&path),
        ServiceAddress::Tcp(addr) => connect_tcp(&addr, timeout),
    }
}

#[cfg(unix)]
fn connect_unix(path: &std::path::Path) -> Result<DataStream> {
    let stream =
        std::os::unix::net::UnixStream::connect(path).map_err(|e| TransportError::Connect {
            address: path.display().to_string(),
            source: e,
        })?;
    debug!(?path, "connected to unix domain socket");
    Ok(DataStream::from_unix(stream))
}

#[cfg(not(unix))]
fn connect_unix(path: &std::path::Path) -> Result<DataStream> {
    Err(TransportError::Unsupported(path.display().to_string()))
}

fn connect_tcp(addr: &str, timeout: Option<Duration>) -> Result<DataStream> {
    let resolved = addr
        .to_socket_addrs()
        .map_err(|e| TransportError::Connect {
            address: addr.to_string(),
            source: e,
        })?;

    let mut last_err = None;
    for socket_addr in resolved {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&socket_addr, timeout),
            None => TcpStream::connect(socket_addr),
        };
        match attempt {
            Ok(stream) => {
                debug!(%addr, %socket_addr, "connected over tcp");
                return Ok(DataStream::from_tcp(stream));
            }
            Err(err) => last_err = Some(err),
        }
    }

    match (last_err, timeout) {
        (Some(err), Some(timeout)) if err.kind() == std::io::ErrorKind::TimedOut => {
            Err(TransportError::ConnectTimeout {
                address: addr.to_string(),
                timeout,
            })
        }
        (Some(err), _) => Err(TransportError::Connect {
            address: addr.to_string(),
            source: err,
        }),
        (None, _) => Err(TransportError::Connect {
            address: addr.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "address resolved to no socket addresses",
            ),
        }),
    }
}
