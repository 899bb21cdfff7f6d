use std::time::Duration;

use fndata_frame::DEFAULT_MAX_MESSAGE;

use crate::handshake::HandshakeConfig;

/// Default bound on the transport connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Buffered payload size at which a sender emits a chunk.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 1024 * 1024;

/// Settings shared by every connection a [`crate::DataClient`] or
/// [`crate::DataListener`] creates.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on the transport connect. The handshake has its own timeout.
    pub connect_timeout: Duration,
    /// Handshake negotiation settings.
    pub handshake: HandshakeConfig,
    /// Largest message body accepted or produced after the handshake.
    pub max_message_size: usize,
    /// Senders emit a chunk once this many payload bytes are buffered.
    pub flush_threshold: usize,
    /// Write timeout on established connections. `None` blocks indefinitely.
    pub write_timeout: Option<Duration>,
    /// Identifier sent in the handshake (connecting side) or used to prefix
    /// assigned peer ids (accepting side).
    pub client_id: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake: HandshakeConfig::default(),
            max_message_size: DEFAULT_MAX_MESSAGE,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            write_timeout: None,
            client_id: format!("fndata-{}", std::process::id()),
        }
    }
}

impl ClientConfig {
    /// Largest payload a single chunk for `endpoint` may carry so that a
    /// one-chunk message stays within `max_message_size`.
    pub(crate) fn max_chunk_payload(&self, endpoint: &fndata_frame::LogicalEndpoint) -> usize {
        let overhead = fndata_frame::elements_body_len(&[fndata_frame::Chunk::last(
            endpoint.clone(),
        )]);
        self.max_message_size.saturating_sub(overhead)
    }
}
