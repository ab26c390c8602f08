//! # tunnelmux
//!
//! Multiplexes an arbitrary number of independent TCP client connections
//! over a single persistent control connection, using a length-prefixed
//! binary framing protocol.
//!
//! One side (the [`forwarder::Forwarder`]) accepts real client connections
//! and forwards their traffic, wrapped in frames, to a remote controller
//! over one socket. The controller side (the [`tunnel::TunnelTransport`])
//! unwraps frames and exposes each remote client as a
//! [`tunnel::VirtualSocket`] that behaves like a real one to consumers.
//!
//! ## Architecture
//!
//! ```text
//! real client ──► Forwarder ──► Frame::encode ──► control socket
//!                                                      │
//!            TunnelTransport ◄── reassembly ◄──────────┘
//!                   │
//!            EndpointTable lookup ──► VirtualSocket ──► consumer
//! ```
//!
//! The reverse path (a consumer writing to a virtual socket) flows
//! symmetrically back through the control socket to the real client.

pub mod config;
pub mod forwarder;
pub mod socket;
pub mod tunnel;
pub mod wire;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum frame payload size; the wire format carries the length in 16 bits
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// Default port the forwarder listens on for controller connections
pub const DEFAULT_CONTROL_PORT: u16 = 12345;

/// Default port the forwarder listens on for real clients
pub const DEFAULT_FORWARD_PORT: u16 = 4782;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Forwarder error: {0}")]
    Forwarder(#[from] forwarder::ForwarderError),

    #[error("Configuration error: {0}")]
    Config(String),
}
