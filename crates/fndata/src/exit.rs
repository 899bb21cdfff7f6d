use std::fmt;
use std::io;

use fndata_client::{DataError, InboundError};
use fndata_frame::FrameError;
use fndata_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    CliError::new(io_code(&err), format!("{context}: {err}"))
}

pub fn data_error(context: &str, err: DataError) -> CliError {
    CliError::new(data_code(&err), format!("{context}: {err}"))
}

pub fn inbound_error(context: &str, err: InboundError) -> CliError {
    CliError::new(inbound_code(&err), format!("{context}: {err}"))
}

fn io_code(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    }
}

fn transport_code(err: &TransportError) -> i32 {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_code(source),
        TransportError::ConnectTimeout { .. } => TIMEOUT,
        TransportError::InvalidDescriptor { .. } => USAGE,
        _ => TRANSPORT_ERROR,
    }
}

fn frame_code(err: &FrameError) -> i32 {
    match err {
        FrameError::Io(source) => io_code(source),
        FrameError::MessageTooLarge { .. } | FrameError::FieldTooLong { .. } => DATA_INVALID,
        FrameError::ConnectionClosed => FAILURE,
        FrameError::InvalidMagic
        | FrameError::UnsupportedVersion(_)
        | FrameError::UnknownKind(_)
        | FrameError::Malformed(_) => TRANSPORT_ERROR,
    }
}

fn data_code(err: &DataError) -> i32 {
    match err {
        DataError::Transport(err) => transport_code(err),
        DataError::Frame(err) => frame_code(err),
        DataError::Connect { source, .. } => data_code(source),
        DataError::Connection { .. } | DataError::Disconnected(_) => FAILURE,
        DataError::HandshakeFailed(_) => TRANSPORT_ERROR,
        DataError::Timeout(_) => TIMEOUT,
        DataError::DuplicateRegistration { .. }
        | DataError::NotFound { .. }
        | DataError::InvalidRegistration(_)
        | DataError::SenderClosed(_) => USAGE,
        DataError::Codec(_) | DataError::Json(_) => DATA_INVALID,
        DataError::Inbound(err) => inbound_code(err),
    }
}

fn inbound_code(err: &InboundError) -> i32 {
    match err {
        InboundError::ConnectionClosed { .. } => FAILURE,
        InboundError::Decode { .. } => DATA_INVALID,
        InboundError::Receiver { .. } => INTERNAL,
    }
}
