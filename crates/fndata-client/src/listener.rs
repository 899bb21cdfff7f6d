use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fndata_transport::{ServiceDescriptor, TransportListener};
use tracing::info;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::Result;

/// Accepting side of the data plane: the runner end that a [`crate::DataClient`]
/// connects to. Accepted connections offer the same receiver and sender API.
pub struct DataListener {
    listener: TransportListener,
    config: ClientConfig,
    next_peer_id: AtomicU64,
}

impl DataListener {
    /// Bind with default configuration.
    pub fn bind(descriptor: &ServiceDescriptor) -> Result<Self> {
        Self::bind_with_config(descriptor, ClientConfig::default())
    }

    pub fn bind_with_config(descriptor: &ServiceDescriptor, config: ClientConfig) -> Result<Self> {
        let listener = TransportListener::bind(descriptor)?;
        info!(descriptor = %listener.descriptor(), "data listener bound");
        Ok(Self {
            listener,
            config,
            next_peer_id: AtomicU64::new(1),
        })
    }

    /// Descriptor connecting clients should use; for TCP it carries the
    /// actually bound port.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        self.listener.descriptor()
    }

    /// Accept the next connection and start reading from it.
    pub fn accept(&self) -> Result<Arc<Connection>> {
        self.accept_with(|_| Ok(())).map(|(connection, ())| connection)
    }

    /// Accept the next connection and run `setup` before its reader thread
    /// starts, so receivers registered there see every chunk the peer sends.
    pub fn accept_with<T, F>(&self, setup: F) -> Result<(Arc<Connection>, T)>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let stream = self.listener.accept()?;
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let peer_id = format!("{}-peer-{id}", self.config.client_id);

        let connection = Connection::accept(
            stream,
            self.listener.descriptor().clone(),
            &peer_id,
            &self.config,
        )?;
        let value = setup(&connection)?;
        connection.start()?;

        info!(
            descriptor = %connection.descriptor(),
            peer_id = %peer_id,
            client_id = %connection.peer_id(),
            "accepted data connection"
        );
        Ok((Arc::new(connection), value))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
