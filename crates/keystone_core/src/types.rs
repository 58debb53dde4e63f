//! # Core Type Definitions
//!
//! Fundamental types shared by every component of the core:
//!
//! - [`ClientId`] - Identity of one connected client
//! - [`Direction`] - Which way a protocol message is travelling
//! - [`Packet`] - One protocol message, carried as opaque bytes
//!
//! The core never interprets a [`Packet`] beyond optional named-field
//! extraction. Forwarding always reuses the original bytes, so a message
//! that is not cancelled leaves the interceptor exactly as it arrived.

use crate::error::FieldError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a connected client.
///
/// A wrapper around UUID so client identities cannot be confused with
/// other identifiers flowing through the host.
///
/// # Examples
///
/// ```rust
/// use keystone_core::ClientId;
///
/// let client = ClientId::new();
/// let parsed: ClientId = client.to_string().parse().unwrap();
/// assert_eq!(client, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Creates a new random client ID using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a protocol message relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client to server.
    Inbound,
    /// Server to client.
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

// ============================================================================
// Packet
// ============================================================================

/// Member name that carries a packet's message kind.
pub const KIND_FIELD: &str = "type";

/// One protocol message.
///
/// The bytes are shared behind an `Arc`, so cloning a packet to hand it to
/// the dispatcher never copies the payload. Packets are immutable: a
/// consumer can inspect or cancel a message but never rewrite it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Packet {
    raw: Arc<[u8]>,
}

impl Packet {
    /// Wraps raw frame bytes as a packet.
    pub fn new(raw: impl Into<Vec<u8>>) -> Self {
        Self {
            raw: Arc::from(raw.into()),
        }
    }

    /// Builds a packet from a JSON value.
    ///
    /// Used by per-revision variants to synthesise messages. Serialising a
    /// `serde_json::Value` cannot fail, so this is infallible.
    pub fn from_json(value: &serde_json::Value) -> Self {
        Self::new(value.to_string().into_bytes())
    }

    /// The exact bytes of this message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Length of the message in bytes.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the message carries no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Copies the bytes out into an owned buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.raw.to_vec()
    }

    /// Extracts a named member of the payload.
    ///
    /// The payload is read as a JSON object; nothing else about its schema
    /// is assumed.
    ///
    /// # Errors
    ///
    /// * [`FieldError::Malformed`] if the payload is not a JSON object
    /// * [`FieldError::NotFound`] if the object has no member called `name`
    pub fn field(&self, name: &str) -> Result<serde_json::Value, FieldError> {
        let mut object = self.object()?;
        object.remove(name).ok_or_else(|| FieldError::NotFound {
            field: name.to_string(),
        })
    }

    /// Extracts a named member and deserializes it into `T`.
    ///
    /// # Errors
    ///
    /// As [`Packet::field`], plus [`FieldError::TypeMismatch`] when the member
    /// exists but does not deserialize into `T`.
    pub fn field_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, FieldError> {
        let value = self.field(name)?;
        serde_json::from_value(value).map_err(|e| FieldError::TypeMismatch {
            field: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// The message kind, read from the `"type"` member.
    pub fn kind(&self) -> Result<String, FieldError> {
        self.field_as::<String>(KIND_FIELD)
    }

    /// Returns true when the message kind equals `kind`.
    ///
    /// Malformed payloads and payloads without a kind never match.
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind().map(|k| k == kind).unwrap_or(false)
    }

    fn object(&self) -> Result<serde_json::Map<String, serde_json::Value>, FieldError> {
        match serde_json::from_slice::<serde_json::Value>(&self.raw) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(other) => Err(FieldError::Malformed(format!(
                "expected a JSON object, found {}",
                json_type_name(&other)
            ))),
            Err(e) => Err(FieldError::Malformed(e.to_string())),
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.raw.len())
            .field("kind", &self.kind().ok())
            .finish()
    }
}

impl From<Vec<u8>> for Packet {
    fn from(raw: Vec<u8>) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for Packet {
    fn from(raw: &str) -> Self {
        Self::new(raw.as_bytes().to_vec())
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_extraction() {
        let packet = Packet::from_json(&json!({"type": "chat", "text": "hi"}));
        assert_eq!(packet.kind().unwrap(), "chat");
        assert_eq!(packet.field("text").unwrap(), json!("hi"));
        assert!(packet.is_kind("chat"));
        assert!(!packet.is_kind("move"));
    }

    #[test]
    fn test_missing_field_is_not_found() {
        let packet = Packet::from_json(&json!({"type": "chat"}));
        match packet.field("text") {
            Err(FieldError::NotFound { field }) => assert_eq!(field, "text"),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_non_object_payload_is_malformed() {
        let packet = Packet::from("[1, 2, 3]");
        assert!(matches!(packet.field("type"), Err(FieldError::Malformed(_))));

        let garbage = Packet::new(vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(matches!(garbage.kind(), Err(FieldError::Malformed(_))));
        assert!(!garbage.is_kind("chat"));
    }

    #[test]
    fn test_field_type_mismatch() {
        let packet = Packet::from_json(&json!({"type": "move", "x": "not a number"}));
        assert!(matches!(
            packet.field_as::<f64>("x"),
            Err(FieldError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_clone_shares_bytes() {
        let packet = Packet::from("{\"type\":\"ping\"}");
        let copy = packet.clone();
        assert_eq!(packet.as_bytes().as_ptr(), copy.as_bytes().as_ptr());
        assert_eq!(packet, copy);
    }

    #[test]
    fn test_client_id_round_trip() {
        let id = ClientId::new();
        let parsed: ClientId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
