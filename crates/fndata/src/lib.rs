//! Multiplexed data plane for bundle processing.
//!
//! Many logical element streams, each addressed by an instruction id and an
//! endpoint tag, share one physical connection per remote service.
//!
//! # Crate Structure
//!
//! - [`transport`]: service descriptors and stream transports (UDS, TCP)
//! - [`frame`]: message framing carrying endpoint-tagged chunks
//! - [`client`]: connection cache, receivers, senders and the accepting side
//!   (behind the `client` feature, on by default)

/// Re-export transport types.
pub mod transport {
    pub use fndata_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use fndata_frame::*;
}

/// Re-export client types (requires `client` feature).
#[cfg(feature = "client")]
pub mod client {
    pub use fndata_client::*;
}
