//! Stream transports for the fndata data plane.
//!
//! Resolves [`ServiceDescriptor`]s into physical connections:
//! - Unix domain sockets (Linux/macOS)
//! - TCP
//!
//! This is the lowest layer of fndata. Framing and multiplexing build on the
//! [`DataStream`] type provided here.

pub mod descriptor;
pub mod error;
pub mod listener;
pub mod stream;

pub use descriptor::{ServiceAddress, ServiceDescriptor};
pub use error::{Result, TransportError};
pub use listener::TransportListener;
pub use stream::{connect, DataStream};
