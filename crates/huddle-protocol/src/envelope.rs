//! Replication envelopes exchanged between nodes over the broker.
//!
//! Every envelope carries an `action`, the channel or room it targets, the
//! node that produced it (`origin`) and an arbitrary state snapshot that is
//! flattened into the top-level JSON object:
//!
//! ```json
//! {"action": "join", "channel_id": "c1", "user": {...}, "origin": "node-a"}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::ProtocolError;

/// Broker topic names, one per replicated event category.
pub mod topics {
    /// Presence joins, leaves and profile refreshes.
    pub const PRESENCE: &str = "presence";
    /// Typing indicators.
    pub const TYPING: &str = "typing";
    /// Voice room state and signaling relay.
    pub const VOICE: &str = "voice";
}

/// A replicated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// What happened (`join`, `leave`, `state`, ...).
    pub action: String,

    /// Text channel the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,

    /// Voice room the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,

    /// Node id of the publisher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// Event state, flattened into the envelope object.
    #[serde(flatten)]
    pub state: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope scoped to a text channel.
    #[must_use]
    pub fn for_channel(action: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            channel_id: Some(channel_id.into()),
            room: None,
            origin: None,
            state: Map::new(),
        }
    }

    /// Create an envelope scoped to a voice room.
    #[must_use]
    pub fn for_room(action: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            channel_id: None,
            room: Some(room.into()),
            origin: None,
            state: Map::new(),
        }
    }

    /// Attach a state field.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented as JSON.
    pub fn with<T: Serialize>(mut self, key: &str, value: T) -> Result<Self, ProtocolError> {
        self.state.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Stamp the envelope with the publishing node id.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Whether this envelope was published by `node_id`.
    #[must_use]
    pub fn is_from(&self, node_id: &str) -> bool {
        self.origin.as_deref() == Some(node_id)
    }

    /// The channel id or room this envelope targets.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.channel_id.as_deref().or(self.room.as_deref())
    }

    /// Read a typed state field.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MissingField`] if the field is absent, or a
    /// JSON error if it has the wrong shape.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Result<T, ProtocolError> {
        let value = self
            .state
            .get(key)
            .ok_or_else(|| ProtocolError::MissingField(key.to_string()))?;
        Ok(T::deserialize(value)?)
    }

    /// Read an optional typed state field. `null` and absent are both `None`.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if the field is present with the wrong shape.
    pub fn optional_field<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ProtocolError> {
        match self.state.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(T::deserialize(value)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_is_flattened() {
        let envelope = Envelope::for_channel("join", "general")
            .with("user", json!({"user_id": "u1"}))
            .unwrap()
            .with_origin("node-a");

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "join",
                "channel_id": "general",
                "user": {"user_id": "u1"},
                "origin": "node-a"
            })
        );
    }

    #[test]
    fn test_origin_check() {
        let envelope = Envelope::for_room("state", "r1").with_origin("node-a");
        assert!(envelope.is_from("node-a"));
        assert!(!envelope.is_from("node-b"));
        assert!(!Envelope::for_room("state", "r1").is_from("node-a"));
    }

    #[test]
    fn test_typed_fields() {
        let envelope: Envelope = serde_json::from_value(json!({
            "action": "set",
            "room": "r1",
            "count": 3,
            "note": null
        }))
        .unwrap();

        assert_eq!(envelope.target(), Some("r1"));
        assert_eq!(envelope.field::<u32>("count").unwrap(), 3);
        assert_eq!(envelope.optional_field::<String>("note").unwrap(), None);
        assert!(matches!(
            envelope.field::<String>("missing"),
            Err(ProtocolError::MissingField(_))
        ));
    }
}
