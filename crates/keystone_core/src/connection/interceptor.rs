//! Per-connection duplex interceptor.
use crate::dispatch::{DispatchOutcome, EventDispatcher};
use crate::events::ProtocolEvent;
use crate::types::{ClientId, Direction, Packet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Decides, message by message, whether a connection's traffic proceeds.
///
/// The host calls [`intercept`](Self::intercept) for every inbound message
/// after decoding and for every outbound message before encoding, one at a
/// time per direction. A returned packet is the original one, untouched;
/// `None` means the message must not be forwarded.
pub struct PacketInterceptor {
    client: ClientId,
    dispatcher: Arc<EventDispatcher>,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl PacketInterceptor {
    pub fn new(client: ClientId, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            client,
            dispatcher,
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Dispatches one message and returns it if it may proceed.
    pub async fn intercept(&self, direction: Direction, packet: Packet) -> Option<Packet> {
        let event = ProtocolEvent::new(self.client, direction, packet.clone());
        let outcome = self.dispatcher.dispatch(event).await;
        self.decide(direction, packet, outcome)
    }

    /// Blocking form of [`intercept`](Self::intercept) for hosts that run a
    /// plain OS thread per connection.
    pub fn intercept_blocking(&self, direction: Direction, packet: Packet) -> Option<Packet> {
        let event = ProtocolEvent::new(self.client, direction, packet.clone());
        let outcome = self.dispatcher.dispatch_blocking(event);
        self.decide(direction, packet, outcome)
    }

    /// Messages allowed through so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Messages suppressed so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn decide(&self, direction: Direction, packet: Packet, outcome: DispatchOutcome) -> Option<Packet> {
        if outcome.cancelled {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(
                "Dropped {} {:?} for client {} ({:?})",
                direction,
                packet,
                self.client,
                outcome.status
            );
            None
        } else {
            self.forwarded.fetch_add(1, Ordering::Relaxed);
            Some(packet)
        }
    }
}

impl std::fmt::Debug for PacketInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketInterceptor")
            .field("client", &self.client)
            .field("forwarded", &self.forwarded())
            .field("dropped", &self.dropped())
            .finish()
    }
}
