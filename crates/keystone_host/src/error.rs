//! Error types for the host server.

use keystone_core::{ConnectionError, CoreError};
use thiserror::Error;

/// Errors raised by the host while accepting or serving connections.
#[derive(Debug, Error)]
pub enum HostError {
    /// Binding, accepting or talking over a socket failed.
    #[error("Network error: {0}")]
    Network(String),

    /// The client did not complete the WebSocket handshake in time.
    #[error("Handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// The core refused to register the connection.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
