/// Errors that can occur while encoding or decoding data-plane messages.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The message header contains an invalid magic number.
    #[error("invalid message magic (expected 0x4644 \"FD\")")]
    InvalidMagic,

    /// The peer speaks a wire version this build does not understand.
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    /// The message kind byte is not CONTROL or ELEMENTS.
    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    /// The message body exceeds the configured maximum size.
    #[error("message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// An identifier does not fit its length prefix.
    #[error("{field} too long ({len} bytes, max {max})", max = u16::MAX)]
    FieldTooLong { field: &'static str, len: usize },

    /// The message body does not parse as a sequence of chunks.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// An I/O error occurred while reading or writing messages.
    #[error("message I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete message was received.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
