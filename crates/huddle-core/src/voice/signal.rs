//! WebRTC signaling payloads.
//!
//! The manager relays these without looking inside: SDP descriptions and
//! ICE candidates are opaque JSON.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Well-known signal kinds.
pub mod kinds {
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const CANDIDATE: &str = "candidate";
    pub const BYE: &str = "bye";
}

/// One signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SignalPayload {
    /// A signal of any kind with no body.
    #[must_use]
    pub fn generic(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: None,
            candidate: None,
            track: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn offer(description: Value) -> Self {
        Self {
            description: Some(description),
            ..Self::generic(kinds::OFFER)
        }
    }

    #[must_use]
    pub fn answer(description: Value) -> Self {
        Self {
            description: Some(description),
            ..Self::generic(kinds::ANSWER)
        }
    }

    #[must_use]
    pub fn candidate(candidate: Value) -> Self {
        Self {
            candidate: Some(candidate),
            ..Self::generic(kinds::CANDIDATE)
        }
    }

    #[must_use]
    pub fn bye() -> Self {
        Self::generic(kinds::BYE)
    }

    /// Scope the signal to one media track.
    #[must_use]
    pub fn with_track(mut self, track: impl Into<String>) -> Self {
        self.track = Some(track.into());
        self
    }

    /// Attach an extra top-level field. Reserved keys are ignored.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        if !matches!(key.as_str(), "kind" | "description" | "candidate" | "track") {
            self.extra.insert(key, value);
        }
        self
    }
}

/// Client event carrying a relayed signal.
#[must_use]
pub fn signal_event(room: &str, from: &str, signal: &SignalPayload) -> Value {
    json!({
        "type": "voice_signal",
        "room": room,
        "from": from,
        "signal": signal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let signal = SignalPayload::offer(json!({"type": "offer", "sdp": "v=0"}))
            .with_track("screen")
            .with_extra("target", json!("u2"))
            .with_extra("kind", json!("ignored"));

        assert_eq!(
            serde_json::to_value(&signal).unwrap(),
            json!({
                "kind": "offer",
                "description": {"type": "offer", "sdp": "v=0"},
                "track": "screen",
                "target": "u2"
            })
        );
    }

    #[test]
    fn test_unknown_fields_survive_relay() {
        let raw = json!({"kind": "renegotiate", "reason": "codec", "seq": 4});
        let signal: SignalPayload = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(signal.kind, "renegotiate");
        assert_eq!(serde_json::to_value(&signal).unwrap(), raw);

        let event = signal_event("r1", "u1", &SignalPayload::bye());
        assert_eq!(event["signal"], json!({"kind": "bye"}));
    }
}
