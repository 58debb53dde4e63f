//! Intercepted protocol messages as events.

use crate::error::FieldError;
use crate::types::{current_timestamp, ClientId, Direction, Packet};
use serde::de::DeserializeOwned;

/// One intercepted message on its way through a connection.
///
/// Consumers may inspect the payload and set the cancelled flag. The payload
/// itself is read-only: a message is either forwarded byte-for-byte or
/// dropped.
#[derive(Debug, Clone)]
pub struct ProtocolEvent {
    client: ClientId,
    direction: Direction,
    packet: Packet,
    cancelled: bool,
    intercepted_at: u64,
}

impl ProtocolEvent {
    pub fn new(client: ClientId, direction: Direction, packet: Packet) -> Self {
        Self {
            client,
            direction,
            packet,
            cancelled: false,
            intercepted_at: current_timestamp(),
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    /// Milliseconds since the Unix epoch at which the message was intercepted.
    pub fn intercepted_at(&self) -> u64 {
        self.intercepted_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn set_cancelled(&mut self, cancelled: bool) {
        self.cancelled = cancelled;
    }

    /// Marks the message to be dropped.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Extracts a named member of the payload.
    ///
    /// # Errors
    ///
    /// [`FieldError::NotFound`] when the payload has no such member.
    pub fn field(&self, name: &str) -> Result<serde_json::Value, FieldError> {
        self.packet.field(name)
    }

    /// Extracts and deserializes a named member of the payload.
    pub fn field_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, FieldError> {
        self.packet.field_as(name)
    }

    /// The payload's message kind, if it has one.
    pub fn kind(&self) -> Option<String> {
        self.packet.kind().ok()
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.packet.is_kind(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cancel_and_fields() {
        let packet = Packet::from_json(&json!({"type": "Chat", "text": "hi"}));
        let mut event = ProtocolEvent::new(ClientId::new(), Direction::Inbound, packet);

        assert!(!event.is_cancelled());
        assert!(event.is_kind("Chat"));
        assert_eq!(event.field_as::<String>("text").unwrap(), "hi");
        assert_eq!(
            event.field("missing"),
            Err(FieldError::NotFound {
                field: "missing".into()
            })
        );

        event.cancel();
        assert!(event.is_cancelled());
        event.set_cancelled(false);
        assert!(!event.is_cancelled());
    }

    #[test]
    fn test_opaque_payload_has_no_kind() {
        let event = ProtocolEvent::new(
            ClientId::new(),
            Direction::Outbound,
            Packet::new(vec![0u8, 159, 146, 150]),
        );
        assert_eq!(event.kind(), None);
        assert!(matches!(event.field("type"), Err(FieldError::Malformed(_))));
    }
}
