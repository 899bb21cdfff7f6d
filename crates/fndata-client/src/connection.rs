use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use fndata_frame::{Chunk, FrameConfig, FrameError, LogicalEndpoint, MessageReader, MessageWriter};
use fndata_transport::{DataStream, ServiceDescriptor};
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::completion::Completion;
use crate::config::ClientConfig;
use crate::demux;
use crate::error::{DataError, InboundError, Result};
use crate::handshake::{handshake_client, handshake_server, HandshakeResult};
use crate::receiver::Inbound;
use crate::registry::{InboundEntry, ReceiverRegistry, SharedEntry, Unregistered};
use crate::sender::OutboundSender;

const SHUTDOWN_REASON: &str = "connection shut down";

/// State shared between a [`Connection`], its reader thread and its senders.
pub(crate) struct ConnectionShared {
    descriptor: ServiceDescriptor,
    config: ClientConfig,
    registry: Mutex<ReceiverRegistry>,
    writer: Mutex<MessageWriter<DataStream>>,
    control: DataStream,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
}

impl ConnectionShared {
    pub(crate) fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn lock_registry(&self) -> MutexGuard<'_, ReceiverRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close_reason(&self) -> Option<String> {
        self.close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn closed_error(&self) -> DataError {
        DataError::Connection {
            descriptor: self.descriptor.clone(),
            reason: self
                .close_reason()
                .unwrap_or_else(|| "connection closed".to_string()),
        }
    }

    /// Mark the connection closed and fail every open receiver. Only the
    /// first call has any effect.
    pub(crate) fn fail(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());

        if let Err(err) = self.control.shutdown() {
            debug!(descriptor = %self.descriptor, error = %err, "socket shutdown failed");
        }

        let entries = self.lock_registry().drain_failed();
        let err = InboundError::ConnectionClosed {
            descriptor: self.descriptor.clone(),
            reason: reason.to_string(),
        };
        let mut failed = 0usize;
        for (_, entry) in &entries {
            if entry.fail(err.clone()) {
                failed += 1;
            }
        }

        debug!(
            descriptor = %self.descriptor,
            reason,
            receivers = entries.len(),
            failed,
            "connection closed"
        );
        true
    }

    /// Write `chunks` as one message under the write lock.
    pub(crate) fn write_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return Err(self.closed_error());
        }

        match writer.write_elements(chunks) {
            Ok(()) => Ok(()),
            // Rejected before any byte hit the wire.
            Err(err @ (FrameError::MessageTooLarge { .. } | FrameError::FieldTooLong { .. })) => {
                Err(DataError::Frame(err))
            }
            Err(err) => {
                drop(writer);
                let reason = format!("write failed: {err}");
                warn!(descriptor = %self.descriptor, error = %err, "data connection write failed");
                self.fail(&reason);
                Err(DataError::Connection {
                    descriptor: self.descriptor.clone(),
                    reason,
                })
            }
        }
    }

    fn register(&self, instruction_id: &str, entry: SharedEntry) -> Result<()> {
        let mut registry = self.lock_registry();
        // Checked under the registry lock so `fail` cannot miss the entry.
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if !registry.insert(instruction_id, entry) {
            return Err(DataError::DuplicateRegistration {
                instruction_id: instruction_id.to_string(),
                descriptor: self.descriptor.clone(),
            });
        }
        debug!(descriptor = %self.descriptor, instruction_id, "registered receiver");
        Ok(())
    }

    fn unregister(&self, instruction_id: &str) -> Result<()> {
        let outcome = self.lock_registry().unregister(instruction_id);
        match outcome {
            Unregistered::Removed(entry) => {
                let previous = entry.close();
                let (chunks, bytes) = entry.stats();
                debug!(
                    descriptor = %self.descriptor,
                    instruction_id = entry.instruction_id(),
                    state = ?previous,
                    chunks,
                    bytes,
                    "unregistered receiver"
                );
                Ok(())
            }
            Unregistered::AlreadyFailed => {
                debug!(
                    descriptor = %self.descriptor,
                    instruction_id,
                    "receiver already failed; unregister is a no-op"
                );
                Ok(())
            }
            Unregistered::Unknown => Err(DataError::NotFound {
                instruction_id: instruction_id.to_string(),
                descriptor: self.descriptor.clone(),
            }),
        }
    }

    fn discard(&self, instruction_id: &str, entry: &SharedEntry) {
        self.lock_registry().remove_if_same(instruction_id, entry);
    }
}

enum ReaderState {
    Pending(Box<MessageReader<DataStream>>),
    Running(JoinHandle<()>),
    Stopped,
}

/// One physical data connection.
///
/// Every receiver registered on it is fed by a single reader thread, and
/// every sender created from it shares one write lock. Dropping the last
/// handle closes the connection.
pub struct Connection {
    shared: Arc<ConnectionShared>,
    handshake: HandshakeResult,
    reader: Mutex<ReaderState>,
}

impl Connection {
    /// Connect to `descriptor`, run the client handshake and start reading.
    pub(crate) fn connect(descriptor: &ServiceDescriptor, config: &ClientConfig) -> Result<Self> {
        let attempt = || -> Result<Self> {
            let stream = fndata_transport::connect(descriptor, Some(config.connect_timeout))?;
            let (mut reader, mut writer, control) = prepare(stream, config)?;
            let handshake =
                handshake_client(&mut reader, &mut writer, &config.client_id, &config.handshake)?;
            let connection =
                Self::establish(descriptor.clone(), config, handshake, reader, writer, control)?;
            connection.start()?;
            Ok(connection)
        };

        let connection = attempt().map_err(|err| DataError::Connect {
            descriptor: descriptor.clone(),
            source: Box::new(err),
        })?;

        info!(
            descriptor = %descriptor,
            peer_id = %connection.peer_id(),
            transport = connection.shared.control.transport_name(),
            "data connection established"
        );
        Ok(connection)
    }

    /// Run the server handshake on an accepted stream. The reader thread is
    /// not started yet.
    pub(crate) fn accept(
        stream: DataStream,
        descriptor: ServiceDescriptor,
        peer_id: &str,
        config: &ClientConfig,
    ) -> Result<Self> {
        let (mut reader, mut writer, control) = prepare(stream, config)?;
        let handshake = handshake_server(&mut reader, &mut writer, peer_id, &config.handshake)?;
        Self::establish(descriptor, config, handshake, reader, writer, control)
    }

    fn establish(
        descriptor: ServiceDescriptor,
        config: &ClientConfig,
        handshake: HandshakeResult,
        mut reader: MessageReader<DataStream>,
        mut writer: MessageWriter<DataStream>,
        control: DataStream,
    ) -> Result<Self> {
        reader.set_max_message_size(config.max_message_size);
        reader.set_read_timeout(None)?;
        writer.set_max_message_size(config.max_message_size);
        writer.set_write_timeout(config.write_timeout)?;
        Ok(Self::from_parts(descriptor, config, handshake, reader, writer, control))
    }

    pub(crate) fn from_parts(
        descriptor: ServiceDescriptor,
        config: &ClientConfig,
        handshake: HandshakeResult,
        reader: MessageReader<DataStream>,
        writer: MessageWriter<DataStream>,
        control: DataStream,
    ) -> Self {
        let shared = ConnectionShared {
            descriptor,
            config: config.clone(),
            registry: Mutex::new(ReceiverRegistry::new()),
            writer: Mutex::new(writer),
            control,
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
            handshake,
            reader: Mutex::new(ReaderState::Pending(Box::new(reader))),
        }
    }

    /// Start the reader thread. Idempotent.
    pub(crate) fn start(&self) -> Result<()> {
        let mut state = self.lock_reader();
        let reader = match std::mem::replace(&mut *state, ReaderState::Stopped) {
            ReaderState::Pending(reader) => *reader,
            other => {
                *state = other;
                return Ok(());
            }
        };
        if self.shared.is_closed() {
            return Err(self.shared.closed_error());
        }

        match demux::spawn_reader(Arc::clone(&self.shared), reader) {
            Ok(handle) => {
                *state = ReaderState::Running(handle);
                Ok(())
            }
            Err(err) => {
                let reason = format!("failed to start reader thread: {err}");
                self.shared.fail(&reason);
                Err(DataError::Connection {
                    descriptor: self.shared.descriptor.clone(),
                    reason,
                })
            }
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.shared.descriptor
    }

    /// Identifier of the remote side, from the handshake.
    pub fn peer_id(&self) -> &str {
        &self.handshake.peer_id
    }

    pub fn protocol_version(&self) -> &str {
        &self.handshake.protocol_version
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.shared.close_reason()
    }

    /// Number of receivers currently registered.
    pub fn active_receivers(&self) -> usize {
        self.shared.lock_registry().len()
    }

    /// Register `inbound` for `instruction_id` on this connection only.
    pub fn register_receiver(&self, instruction_id: &str, inbound: Inbound) -> Result<Completion> {
        validate_inbound(instruction_id, &inbound)?;
        let entry = InboundEntry::shared(instruction_id, inbound);
        let completion = entry.completion();
        self.shared.register(instruction_id, entry)?;
        Ok(completion)
    }

    pub(crate) fn register_entry(&self, instruction_id: &str, entry: SharedEntry) -> Result<()> {
        self.shared.register(instruction_id, entry)
    }

    pub(crate) fn discard_entry(&self, instruction_id: &str, entry: &SharedEntry) {
        self.shared.discard(instruction_id, entry);
    }

    /// Remove the receiver for `instruction_id`.
    ///
    /// A still-pending completion settles successfully. After the receiver
    /// failed this is a no-op; for an id that is not registered it fails
    /// with [`DataError::NotFound`].
    pub fn unregister_receiver(&self, instruction_id: &str) -> Result<()> {
        self.shared.unregister(instruction_id)
    }

    /// Open an outbound stream for `endpoint`.
    pub fn sender<C: Codec>(&self, endpoint: LogicalEndpoint, codec: C) -> Result<OutboundSender<C>> {
        if self.shared.is_closed() {
            return Err(self.shared.closed_error());
        }
        Ok(OutboundSender::new(Arc::clone(&self.shared), endpoint, codec))
    }

    /// Close the connection: open receivers settle with
    /// [`InboundError::ConnectionClosed`], senders fail on their next write.
    pub fn close(&self) {
        if self.shared.fail(SHUTDOWN_REASON) {
            info!(descriptor = %self.shared.descriptor, "data connection closed");
        }

        let state = std::mem::replace(&mut *self.lock_reader(), ReaderState::Stopped);
        if let ReaderState::Running(handle) = state {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(descriptor = %self.shared.descriptor, "reader thread panicked");
            }
        }
    }

    fn lock_reader(&self) -> MutexGuard<'_, ReaderState> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("descriptor", &self.shared.descriptor)
            .field("peer_id", &self.handshake.peer_id)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

pub(crate) fn validate_inbound(instruction_id: &str, inbound: &Inbound) -> Result<()> {
    if let Some(endpoint) = inbound
        .endpoints()
        .find(|endpoint| endpoint.instruction_id() != instruction_id)
    {
        return Err(DataError::InvalidRegistration(format!(
            "endpoint {endpoint} does not belong to instruction {instruction_id}"
        )));
    }
    Ok(())
}

/// Split a stream into handshake-configured reader/writer halves plus a
/// handle for shutting the socket down.
fn prepare(
    stream: DataStream,
    config: &ClientConfig,
) -> Result<(MessageReader<DataStream>, MessageWriter<DataStream>, DataStream)> {
    let handshake_frames = FrameConfig {
        max_message_size: config.handshake.max_handshake_payload,
        read_timeout: Some(config.handshake.timeout),
        write_timeout: Some(config.handshake.timeout),
    };
    let control = stream.try_clone()?;
    let reader = MessageReader::for_stream(stream.try_clone()?, handshake_frames.clone())?;
    let writer = MessageWriter::for_stream(stream, handshake_frames)?;
    Ok((reader, writer, control))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Two connected, already started connections with no handshake.
    pub(crate) fn pair(config: &ClientConfig) -> (Connection, Connection) {
        let (left, right) = DataStream::pair().unwrap();
        (from_stream(left, "left", config), from_stream(right, "right", config))
    }

    pub(crate) fn from_stream(stream: DataStream, name: &str, config: &ClientConfig) -> Connection {
        let control = stream.try_clone().unwrap();
        let mut reader = MessageReader::new(stream.try_clone().unwrap());
        reader.set_max_message_size(config.max_message_size);
        let mut writer = MessageWriter::new(stream);
        writer.set_max_message_size(config.max_message_size);
        let connection = Connection::from_parts(
            ServiceDescriptor::new(format!("unix:///test/{name}.sock")),
            config,
            HandshakeResult {
                peer_id: format!("{name}-peer"),
                protocol_version: "1.0".to_string(),
            },
            reader,
            writer,
            control,
        );
        connection.start().unwrap();
        connection
    }
}
