use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fndata_frame::LogicalEndpoint;
use fndata_transport::ServiceDescriptor;
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::completion::Completion;
use crate::config::ClientConfig;
use crate::connection::{validate_inbound, Connection};
use crate::error::{DataError, Result};
use crate::receiver::Inbound;
use crate::registry::InboundEntry;
use crate::sender::OutboundSender;

type Slot = Arc<Mutex<Option<Arc<Connection>>>>;

/// Entry point of the data plane: caches one connection per remote
/// descriptor and exposes the register/unregister/send operations.
///
/// All methods take `&self`; share the client between threads with `Arc`.
pub struct DataClient {
    config: ClientConfig,
    slots: Mutex<HashMap<ServiceDescriptor, Slot>>,
    shut_down: AtomicBool,
}

impl DataClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The connection for `descriptor`, establishing it on first use.
    ///
    /// Concurrent callers for the same descriptor share one establishment;
    /// callers for other descriptors are not blocked by it. A failed attempt
    /// leaves nothing cached, so a later call tries again.
    pub fn connection(&self, descriptor: &ServiceDescriptor) -> Result<Arc<Connection>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(self.shut_down_error(descriptor));
        }

        let slot = Arc::clone(self.lock_slots().entry(descriptor.clone()).or_default());
        let mut cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(connection) = cached.as_ref() {
            return Ok(Arc::clone(connection));
        }
        // A shutdown that raced with us may already have passed this slot.
        if self.shut_down.load(Ordering::Acquire) {
            return Err(self.shut_down_error(descriptor));
        }

        let connection = Arc::new(Connection::connect(descriptor, &self.config)?);
        *cached = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Register `inbound` for `instruction_id` on every descriptor.
    ///
    /// The same receiver is installed on each connection; if any installation
    /// fails, the ones already made are rolled back. The returned completion
    /// settles once every endpoint in `inbound` has ended.
    pub fn register_receiver(
        &self,
        instruction_id: &str,
        descriptors: &[ServiceDescriptor],
        inbound: Inbound,
    ) -> Result<Completion> {
        validate_inbound(instruction_id, &inbound)?;
        let descriptors: BTreeSet<&ServiceDescriptor> = descriptors.iter().collect();
        if descriptors.is_empty() {
            return Err(DataError::InvalidRegistration(format!(
                "no descriptors given for instruction {instruction_id}"
            )));
        }

        let endpoints = inbound.len();
        let entry = InboundEntry::shared(instruction_id, inbound);
        let completion = entry.completion();

        let mut installed: Vec<Arc<Connection>> = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            let result = self
                .connection(descriptor)
                .and_then(|connection| {
                    connection.register_entry(instruction_id, Arc::clone(&entry))?;
                    Ok(connection)
                });
            match result {
                Ok(connection) => installed.push(connection),
                Err(err) => {
                    for connection in &installed {
                        connection.discard_entry(instruction_id, &entry);
                    }
                    warn!(
                        instruction_id,
                        descriptor = %descriptor,
                        error = %err,
                        "receiver registration failed; rolled back"
                    );
                    return Err(err);
                }
            }
        }

        debug!(
            instruction_id,
            endpoints,
            connections = installed.len(),
            "receiver registered"
        );
        Ok(completion)
    }

    /// Remove the receiver for `instruction_id` from every descriptor.
    ///
    /// Every descriptor is attempted; the first error is returned.
    pub fn unregister_receiver(
        &self,
        instruction_id: &str,
        descriptors: &[ServiceDescriptor],
    ) -> Result<()> {
        let mut first_err = None;
        for descriptor in descriptors.iter().collect::<BTreeSet<_>>() {
            let result = match self.cached(descriptor) {
                Some(connection) => connection.unregister_receiver(instruction_id),
                None => Err(DataError::NotFound {
                    instruction_id: instruction_id.to_string(),
                    descriptor: descriptor.clone(),
                }),
            };
            if let Err(err) = result {
                debug!(instruction_id, descriptor = %descriptor, error = %err, "unregister failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Open an outbound stream for `endpoint` on `descriptor`'s connection.
    pub fn send<C: Codec>(
        &self,
        descriptor: &ServiceDescriptor,
        endpoint: LogicalEndpoint,
        codec: C,
    ) -> Result<OutboundSender<C>> {
        self.connection(descriptor)?.sender(endpoint, codec)
    }

    /// Close one connection and forget it; the next use of `descriptor`
    /// connects afresh. Returns `false` if nothing was cached.
    pub fn close_connection(&self, descriptor: &ServiceDescriptor) -> bool {
        let slot = self.lock_slots().remove(descriptor);
        let connection = slot.and_then(|slot| {
            slot.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
        });
        match connection {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Close every connection. Open receivers settle with a
    /// connection-closed error and senders fail on their next write.
    /// Later calls to [`DataClient::connection`] fail.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let slots: Vec<Slot> = self.lock_slots().values().cloned().collect();
        let mut closed = 0usize;
        for slot in slots {
            let connection = slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(connection) = connection {
                connection.close();
                closed += 1;
            }
        }
        info!(connections = closed, "data client shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Descriptors with an established connection.
    pub fn connected_descriptors(&self) -> Vec<ServiceDescriptor> {
        let slots: Vec<(ServiceDescriptor, Slot)> = self
            .lock_slots()
            .iter()
            .map(|(descriptor, slot)| (descriptor.clone(), Arc::clone(slot)))
            .collect();
        let mut out: Vec<ServiceDescriptor> = slots
            .into_iter()
            .filter(|(_, slot)| {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_some()
            })
            .map(|(descriptor, _)| descriptor)
            .collect();
        out.sort();
        out
    }

    fn cached(&self, descriptor: &ServiceDescriptor) -> Option<Arc<Connection>> {
        let slot = self.lock_slots().get(descriptor).cloned()?;
        let cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        cached.clone()
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<ServiceDescriptor, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shut_down_error(&self, descriptor: &ServiceDescriptor) -> DataError {
        DataError::Connection {
            descriptor: descriptor.clone(),
            reason: "data client shut down".to_string(),
        }
    }
}

impl Default for DataClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Drop for DataClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DataClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataClient")
            .field("client_id", &self.config.client_id)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn connect_failure_is_prompt_and_not_cached() {
        let dir = std::env::temp_dir().join(format!("fndata-client-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let descriptor = ServiceDescriptor::unix(dir.join("nobody-listens.sock"));
        let client = DataClient::default();

        let start = Instant::now();
        let err = client.connection(&descriptor).unwrap_err();
        assert!(matches!(err, DataError::Connect { .. }));
        assert!(err.is_connection_error());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(client.connected_descriptors().is_empty());
    }

    #[test]
    fn invalid_descriptor_fails_to_connect() {
        let client = DataClient::default();
        let err = client
            .connection(&ServiceDescriptor::new("http://nope"))
            .unwrap_err();
        assert!(matches!(err, DataError::Connect { .. }));
    }

    #[test]
    fn registration_requires_descriptors() {
        let client = DataClient::default();
        let err = client
            .register_receiver("i", &[], Inbound::new())
            .unwrap_err();
        assert!(matches!(err, DataError::InvalidRegistration(_)));
    }

    #[test]
    fn unregister_without_connection_is_not_found() {
        let client = DataClient::default();
        let err = client
            .unregister_receiver("i", &[ServiceDescriptor::new("tcp://127.0.0.1:1")])
            .unwrap_err();
        assert!(matches!(err, DataError::NotFound { .. }));
    }

    #[test]
    fn shut_down_client_refuses_connections() {
        let client = DataClient::default();
        client.shutdown();
        assert!(client.is_shut_down());
        let err = client
            .connection(&ServiceDescriptor::new("tcp://127.0.0.1:1"))
            .unwrap_err();
        assert!(matches!(err, DataError::Connection { ref reason, .. } if reason.contains("shut down")));
        assert!(!client.close_connection(&ServiceDescriptor::new("tcp://127.0.0.1:1")));
    }
}
