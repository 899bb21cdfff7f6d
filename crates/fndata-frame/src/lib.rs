//! Multiplexed element-chunk framing for the fndata data plane.
//!
//! Every physical message is framed with:
//! - A 2-byte magic number ("FD") for stream synchronization
//! - A 4-byte little-endian body length
//! - A 1-byte kind (CONTROL or ELEMENTS) and a 1-byte wire version
//!
//! An ELEMENTS body carries any number of [`Chunk`]s, each tagged with its own
//! [`LogicalEndpoint`], so many streams share one connection. Boundaries are
//! always explicit length prefixes, never inferred from payload content.

#[cfg(feature = "async")]
pub mod async_codec;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod reader;
pub mod writer;

#[cfg(feature = "async")]
pub use async_codec::MessageCodec;
pub use codec::{
    decode_message, elements_body_len, encode_control, encode_elements, encode_message, Chunk,
    FrameConfig, Message, DEFAULT_MAX_MESSAGE, HEADER_SIZE, KIND_CONTROL, KIND_ELEMENTS,
    WIRE_VERSION,
};
pub use endpoint::LogicalEndpoint;
pub use error::{FrameError, Result};
pub use reader::MessageReader;
pub use writer::MessageWriter;
