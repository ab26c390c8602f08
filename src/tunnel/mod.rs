//! Tunnel layer - framing, endpoint registry, and the controller-side
//! demultiplexer
//!
//! Provides:
//! - Frame encoding/decoding with partial-read reassembly
//! - The endpoint-keyed registry of virtual connections
//! - [`TunnelTransport`], which turns the control-socket byte stream into
//!   per-endpoint [`VirtualSocket`]s

mod frame;
mod socket;
mod table;
mod transport;

pub use frame::{Frame, FrameKind, FRAME_HEADER_SIZE};
pub use socket::VirtualSocket;
pub use table::EndpointTable;
pub use transport::{TunnelEvent, TunnelTransport};

use std::time::Duration;

use thiserror::Error;

use crate::wire::Endpoint;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Malformed IPv4 address: {0}")]
    MalformedAddress(String),

    #[error("Payload too large for a single frame: {0} > {}", crate::MAX_PAYLOAD_SIZE)]
    PayloadTooLarge(usize),

    #[error("Unknown frame kind: {0:#04x}")]
    UnknownFrameKind(u8),

    #[error("No connection tracked for endpoint {0}")]
    EndpointNotFound(Endpoint),

    #[error("Tunnel failed: {0}")]
    TunnelFailed(String),

    #[error("Socket closed")]
    SocketClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// TCP keep-alive idle time on control and client sockets
pub const KEEP_ALIVE_TIME: Duration = Duration::from_secs(25);

/// TCP keep-alive probe interval on control and client sockets
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(25);
