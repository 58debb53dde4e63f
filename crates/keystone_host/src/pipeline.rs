//! Per-connection WebSocket pipeline.
//!
//! A [`WsPipeline`] is the host side of one client connection. Reading is
//! done by the connection handler; everything written to the client goes
//! through the pipeline's outbound queue, which a single writer task
//! drains in order. The core splices its [`PacketInterceptor`] in between
//! the WebSocket codec and the [`TerminalStage`](crate::TerminalStage).

use keystone_core::{
    ClientId, ConnectionPipeline, Packet, PacketInterceptor, PipelineError, INTERCEPTOR_STAGE,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Name of the stage that turns frames into packets and back.
pub const CODEC_STAGE: &str = "ws_codec";

/// Name of the stage that hands inbound packets to the game.
pub const TERMINAL_STAGE: &str = "keystone_terminal";

/// One unit of work for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// A game message; passes the interceptor before it is written.
    Packet(Packet),
    /// Written as is, bypassing interception.
    Raw(Packet),
    /// Send a close frame and stop writing.
    Close,
}

/// Host pipeline for one WebSocket client.
pub struct WsPipeline {
    client: ClientId,
    sender: mpsc::UnboundedSender<Outbound>,
    interceptor: RwLock<Option<Arc<PacketInterceptor>>>,
    open: AtomicBool,
}

impl WsPipeline {
    /// Creates a pipeline and the receiving end its writer task drains.
    pub fn new(client: ClientId) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pipeline = Arc::new(Self {
            client,
            sender,
            interceptor: RwLock::new(None),
            open: AtomicBool::new(true),
        });
        (pipeline, receiver)
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// The spliced interceptor, if any.
    pub fn interceptor(&self) -> Option<Arc<PacketInterceptor>> {
        self.interceptor.read().clone()
    }

    /// Queues a game message for the client. It is subject to interception.
    pub fn queue(&self, packet: Packet) -> Result<(), PipelineError> {
        self.push(Outbound::Packet(packet))
    }

    /// Marks the pipeline closed and asks the writer to send a close frame.
    /// Returns false if it was already closed.
    pub fn close(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        let _ = self.sender.send(Outbound::Close);
        true
    }

    /// Stage names in wire order, for diagnostics.
    pub fn stages(&self) -> Vec<&'static str> {
        let mut stages = vec![CODEC_STAGE];
        if self.interceptor.read().is_some() {
            stages.push(INTERCEPTOR_STAGE);
        }
        stages.push(TERMINAL_STAGE);
        stages
    }

    fn push(&self, item: Outbound) -> Result<(), PipelineError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }
        self.sender.send(item).map_err(|_| PipelineError::Closed)
    }
}

impl ConnectionPipeline for WsPipeline {
    fn splice(&self, interceptor: Arc<PacketInterceptor>) -> Result<(), PipelineError> {
        if !self.is_open() {
            return Err(PipelineError::Closed);
        }
        let mut slot = self.interceptor.write();
        if slot.is_some() {
            return Err(PipelineError::StageExists(INTERCEPTOR_STAGE.to_string()));
        }
        *slot = Some(interceptor);
        Ok(())
    }

    fn unsplice(&self) -> Result<(), PipelineError> {
        self.interceptor.write().take();
        Ok(())
    }

    fn send_raw(&self, packet: Packet) -> Result<(), PipelineError> {
        self.push(Outbound::Raw(packet))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.sender.is_closed()
    }
}

impl std::fmt::Debug for WsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsPipeline")
            .field("client", &self.client)
            .field("stages", &self.stages())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Converts a packet to the frame it is written as. UTF-8 payloads go out
/// as text frames, anything else as binary.
pub(crate) fn to_message(packet: Packet) -> Message {
    match String::from_utf8(packet.to_vec()) {
        Ok(text) => Message::text(text),
        Err(e) => Message::binary(e.into_bytes()),
    }
}
