//! The last stage of a connection's inbound path.
//!
//! Whatever survives interception reaches a [`TerminalStage`]. In a real
//! server this is the game's own packet handling; the reference host ships
//! [`LoggingTerminal`], which only answers keep-alive requests.

use crate::error::HostError;
use crate::pipeline::WsPipeline;
use async_trait::async_trait;
use keystone_core::{ClientId, Packet};
use serde_json::json;
use tracing::{debug, trace};

/// Receives inbound messages that were not cancelled.
#[async_trait]
pub trait TerminalStage: Send + Sync {
    async fn on_connect(&self, _client: ClientId, _pipeline: &WsPipeline) {}

    /// Handles one forwarded inbound message. Replies go through
    /// [`WsPipeline::queue`] so they are intercepted like any other
    /// outbound message.
    async fn on_message(
        &self,
        client: ClientId,
        packet: Packet,
        pipeline: &WsPipeline,
    ) -> Result<(), HostError>;

    async fn on_disconnect(&self, _client: ClientId) {}
}

/// Default terminal: logs traffic and answers `{"type":"ping"}` with
/// `{"type":"pong"}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTerminal;

#[async_trait]
impl TerminalStage for LoggingTerminal {
    async fn on_connect(&self, client: ClientId, pipeline: &WsPipeline) {
        debug!("Terminal attached for client {}: {:?}", client, pipeline.stages());
    }

    async fn on_message(
        &self,
        client: ClientId,
        packet: Packet,
        pipeline: &WsPipeline,
    ) -> Result<(), HostError> {
        trace!("📨 {} bytes from client {}", packet.len(), client);
        if packet.is_kind("ping") {
            pipeline
                .queue(Packet::from_json(&json!({ "type": "pong" })))
                .map_err(|e| HostError::Network(e.to_string()))?;
        }
        Ok(())
    }
}
