//! Host configuration types and defaults.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Configuration for the reference [`HostServer`](crate::HostServer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// The socket address to accept WebSocket clients on
    pub bind_address: SocketAddr,

    /// Connections beyond this many are refused at accept time
    pub max_connections: usize,

    /// How long a client may take to finish the WebSocket handshake
    pub handshake_timeout_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_connections: 1000,
            handshake_timeout_ms: 10_000,
        }
    }
}
