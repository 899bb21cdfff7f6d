use std::time::Duration;

use fndata_frame::{FrameError, LogicalEndpoint};
use fndata_transport::ServiceDescriptor;

use crate::codec::CodecError;

/// Why an instruction's inbound streams did not finish cleanly.
///
/// This is the value a failed [`crate::Completion`] settles with. It is
/// `Clone` so every waiter observes the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InboundError {
    /// The physical connection closed or was shut down before all streams ended.
    #[error("connection to {descriptor} closed: {reason}")]
    ConnectionClosed {
        descriptor: ServiceDescriptor,
        reason: String,
    },

    /// A chunk payload could not be decoded into records.
    #[error("failed to decode data for {endpoint}: {message}")]
    Decode {
        endpoint: LogicalEndpoint,
        message: String,
    },

    /// The receiver callback rejected a record.
    #[error("receiver for {endpoint} failed: {message}")]
    Receiver {
        endpoint: LogicalEndpoint,
        message: String,
    },
}

/// Errors that can occur in data-plane client operations.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] fndata_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] fndata_frame::FrameError),

    /// Establishing a connection failed. Not retried internally.
    #[error("failed to connect to {descriptor}: {source}")]
    Connect {
        descriptor: ServiceDescriptor,
        source: Box<DataError>,
    },

    /// The connection is closed or broke while in use.
    #[error("connection to {descriptor} unusable: {reason}")]
    Connection {
        descriptor: ServiceDescriptor,
        reason: String,
    },

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peer disconnected before the handshake finished.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// A bounded operation did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A receiver is already registered for this instruction on this connection.
    #[error("instruction {instruction_id} already has a receiver on {descriptor}")]
    DuplicateRegistration {
        instruction_id: String,
        descriptor: ServiceDescriptor,
    },

    /// No receiver is registered for this instruction on this connection.
    #[error("no receiver registered for instruction {instruction_id} on {descriptor}")]
    NotFound {
        instruction_id: String,
        descriptor: ServiceDescriptor,
    },

    /// The registration request itself is inconsistent.
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    /// Encoding an outbound record failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The sender was already closed.
    #[error("sender for {0} is closed")]
    SenderClosed(LogicalEndpoint),

    /// An inbound stream failed.
    #[error(transparent)]
    Inbound(#[from] InboundError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DataError {
    /// True for failures of the physical connection rather than caller misuse
    /// or application data.
    ///
    /// Size and id-length rejections are raised before anything is written,
    /// so the connection that produced them is still usable.
    pub fn is_connection_error(&self) -> bool {
        match self {
            DataError::Frame(err) => !is_local_rejection(err),
            _ => matches!(
                self,
                DataError::Transport(_)
                    | DataError::Connect { .. }
                    | DataError::Connection { .. }
                    | DataError::HandshakeFailed(_)
                    | DataError::Disconnected(_)
                    | DataError::Timeout(_)
                    | DataError::Inbound(InboundError::ConnectionClosed { .. })
            ),
        }
    }
}

fn is_local_rejection(err: &FrameError) -> bool {
    matches!(
        err,
        FrameError::MessageTooLarge { .. } | FrameError::FieldTooLong { .. }
    )
}

pub type Result<T> = std::result::Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_errors() {
        let descriptor = ServiceDescriptor::new("tcp://h:1");
        assert!(DataError::Connection {
            descriptor: descriptor.clone(),
            reason: "eof".into()
        }
        .is_connection_error());
        assert!(DataError::Inbound(InboundError::ConnectionClosed {
            descriptor: descriptor.clone(),
            reason: "eof".into()
        })
        .is_connection_error());

        assert!(!DataError::SenderClosed(LogicalEndpoint::data("i", "t")).is_connection_error());
        assert!(!DataError::NotFound {
            instruction_id: "i".into(),
            descriptor
        }
        .is_connection_error());
        assert!(DataError::Frame(FrameError::ConnectionClosed).is_connection_error());
        assert!(!DataError::Frame(FrameError::MessageTooLarge { size: 71, max: 64 })
            .is_connection_error());
        assert!(!DataError::Frame(FrameError::FieldTooLong {
            field: "transform id",
            len: 70000
        })
        .is_connection_error());
        assert!(!DataError::Inbound(InboundError::Decode {
            endpoint: LogicalEndpoint::data("i", "t"),
            message: "bad".into()
        })
        .is_connection_error());
    }

    #[test]
    fn connect_error_names_descriptor_and_cause() {
        let err = DataError::Connect {
            descriptor: ServiceDescriptor::new("unix:///tmp/x.sock"),
            source: Box::new(DataError::Timeout(Duration::from_secs(1))),
        };
        let text = err.to_string();
        assert!(text.contains("unix:///tmp/x.sock"));
        assert!(text.contains("timed out"));
    }
}
