//! Data-plane client: many logical element streams multiplexed over one
//! physical connection per remote endpoint.
//!
//! - [`DataClient`] caches connections by [`ServiceDescriptor`] and exposes
//!   `register_receiver`, `unregister_receiver` and `send`.
//! - Receivers are described with [`Inbound`]; each registered instruction
//!   yields a [`Completion`] that settles when all of its streams end.
//! - [`OutboundSender`] buffers encoded records and writes chunks through
//!   the connection's single write lock.
//! - [`DataListener`] is the accepting side, offering the same API on each
//!   accepted [`Connection`].
//!
//! Each connection runs one reader thread. Receiver callbacks execute on it
//! serially and must not block indefinitely.

pub mod client;
pub mod codec;
pub mod completion;
pub mod config;
pub mod connection;
mod demux;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod receiver;
mod registry;
pub mod sender;

pub use client::DataClient;
pub use codec::{BytesCodec, Codec, CodecError, JsonCodec, Utf8Codec};
pub use completion::{Completion, CompletionResult};
pub use config::{ClientConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_FLUSH_THRESHOLD};
pub use connection::Connection;
pub use error::{DataError, InboundError, Result};
pub use fndata_frame::LogicalEndpoint;
pub use fndata_transport::ServiceDescriptor;
pub use handshake::{HandshakeConfig, HandshakeResult};
pub use listener::DataListener;
pub use receiver::{ChunkConsumer, Inbound, ReceiveError};
pub use sender::OutboundSender;
