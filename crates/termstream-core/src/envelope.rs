//! Message envelope and its JSON wire codec.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Event,
    Request,
    Response,
}

/// Routing category of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Handshake, ping and other connection-level traffic.
    System,
    /// Terminal I/O and terminal lifecycle relays.
    Terminal,
    File,
    Git,
    /// Editor diagnostics.
    Diagnostic,
    Claude,
    Project,
    /// Pause/resume backpressure signals.
    Flow,
}

impl Category {
    /// Wire name of the category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Terminal => "terminal",
            Self::File => "file",
            Self::Git => "git",
            Self::Diagnostic => "diagnostic",
            Self::Claude => "claude",
            Self::Project => "project",
            Self::Flow => "flow",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Payload does not match {expected}: {source}")]
    Payload {
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// An outgoing message before it is put on the wire.
///
/// Callers build drafts; the transport seals them into an [`Envelope`]
/// at send time, which is when `id` and `timestamp` get assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub kind: MessageType,
    pub category: Category,
    pub payload: Value,
}

impl Outbound {
    /// Create a draft from an already-built JSON payload.
    #[must_use]
    pub const fn new(kind: MessageType, category: Category, payload: Value) -> Self {
        Self {
            kind,
            category,
            payload,
        }
    }

    /// Create an event draft from any serializable payload.
    ///
    /// # Errors
    /// Returns error if the payload cannot be represented as JSON.
    pub fn event<P: Serialize>(category: Category, payload: &P) -> Result<Self, CodecError> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self::new(MessageType::Event, category, payload))
    }

    /// Assign identity and time, producing the immutable envelope.
    #[must_use]
    pub fn seal(self) -> Envelope {
        Envelope {
            id: Uuid::new_v4().to_string(),
            kind: self.kind,
            category: self.category,
            payload: self.payload,
            timestamp: now_millis(),
        }
    }
}

/// Envelope wrapping every message on the persistent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: String,
    #[serde(rename = "type")]
    kind: MessageType,
    category: Category,
    #[serde(default)]
    payload: Value,
    timestamp: u64,
}

impl Envelope {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> MessageType {
        self.kind
    }

    #[must_use]
    pub const fn category(&self) -> Category {
        self.category
    }

    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Milliseconds since the Unix epoch at which the envelope was sealed.
    #[must_use]
    pub const fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Deserialize the payload into a typed message.
    ///
    /// # Errors
    /// Returns error if the payload has a different shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        T::deserialize(&self.payload).map_err(|source| CodecError::Payload {
            expected: std::any::type_name::<T>(),
            source,
        })
    }

    /// Encode into a text frame.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a text frame.
    ///
    /// # Errors
    /// Returns error if the frame is not a well-formed envelope.
    pub fn decode(frame: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Encode only the payload, for endpoints that speak bare messages.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn encode_payload(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&self.payload)?)
    }

    /// Wrap a bare payload frame as an event in `category`.
    ///
    /// # Errors
    /// Returns error if the frame is not JSON.
    pub fn from_bare(category: Category, frame: &str) -> Result<Self, CodecError> {
        let payload: Value = serde_json::from_str(frame)?;
        Ok(Outbound::new(MessageType::Event, category, payload).seal())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_seal_assigns_identity() {
        let a = Outbound::new(MessageType::Event, Category::Git, json!({})).seal();
        let b = Outbound::new(MessageType::Event, Category::Git, json!({})).seal();
        assert_ne!(a.id(), b.id());
        assert!(a.timestamp() > 0);
    }

    #[test]
    fn test_wire_shape() {
        let env = Outbound::new(
            MessageType::Request,
            Category::Terminal,
            json!({"type": "input", "data": "ls"}),
        )
        .seal();
        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["category"], "terminal");
        assert_eq!(value["payload"]["data"], "ls");
        assert!(value["id"].is_string());
        assert!(value["timestamp"].is_u64());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"id":"1","type":"event"}"#).is_err());
        let unknown = r#"{"id":"1","type":"event","category":"weather","payload":{},"timestamp":1}"#;
        assert!(matches!(
            Envelope::decode(unknown),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_bare_frames() {
        let env = Envelope::from_bare(Category::Terminal, r#"{"type":"output","data":"hi"}"#)
            .unwrap();
        assert_eq!(env.kind(), MessageType::Event);
        assert_eq!(env.category(), Category::Terminal);
        assert_eq!(env.payload()["data"], "hi");
        let bare: Value = serde_json::from_str(&env.encode_payload().unwrap()).unwrap();
        assert_eq!(bare, json!({"type": "output", "data": "hi"}));
        assert!(Envelope::from_bare(Category::Terminal, "{oops").is_err());
    }

    #[test]
    fn test_decode_without_payload() {
        let env =
            Envelope::decode(r#"{"id":"x","type":"event","category":"system","timestamp":7}"#)
                .unwrap();
        assert_eq!(env.category(), Category::System);
        assert!(env.payload().is_null());
        assert_eq!(env.timestamp(), 7);
    }
}
