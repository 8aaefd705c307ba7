//! Client commands and the identity they run as.

use axum::http::HeaderMap;
use huddle_core::voice::{Actor, ActorRole, SignalPayload};
use huddle_core::PresenceEntry;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Identity headers set by the authenticating proxy.
pub mod headers {
    pub const USER_ID: &str = "x-user-id";
    pub const DISPLAY_NAME: &str = "x-display-name";
    pub const USER_ROLE: &str = "x-user-role";
}

/// The authenticated user behind a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    pub role: ActorRole,
}

impl Identity {
    /// Read the identity headers. `None` without a user id.
    #[must_use]
    pub fn from_headers(map: &HeaderMap) -> Option<Self> {
        let header = |name: &str| {
            map.get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let user_id = header(headers::USER_ID)?.to_string();
        let display_name = header(headers::DISPLAY_NAME).unwrap_or(&user_id).to_string();
        let role = header(headers::USER_ROLE)
            .map(|r| r.parse().unwrap_or_default())
            .unwrap_or_default();

        Some(Self {
            user_id,
            display_name,
            role,
        })
    }

    #[must_use]
    pub fn actor(&self) -> Actor<'_> {
        Actor::new(&self.user_id, self.role)
    }

    #[must_use]
    pub fn presence(&self, status: Option<String>, avatar_url: Option<String>) -> PresenceEntry {
        let mut entry = PresenceEntry::new(&self.user_id, &self.display_name);
        if let Some(status) = status {
            entry = entry.with_status(status);
        }
        if let Some(avatar_url) = avatar_url {
            entry = entry.with_avatar(avatar_url);
        }
        entry
    }
}

/// A command sent by a client, tagged by `type`.
///
/// Voice commands that take an optional `user_id` act on the sender when it
/// is omitted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Join {
        channel_id: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        avatar_url: Option<String>,
    },
    Leave {
        channel_id: String,
    },
    UpdatePresence {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        avatar_url: Option<String>,
    },
    Typing {
        channel_id: String,
        is_typing: bool,
    },
    VoiceJoin {
        room: String,
    },
    VoiceLeave {
        room: String,
    },
    SetRole {
        room: String,
        #[serde(default)]
        user_id: Option<String>,
        role: String,
    },
    SetMuted {
        room: String,
        #[serde(default)]
        user_id: Option<String>,
        muted: bool,
    },
    SetDeafened {
        room: String,
        #[serde(default)]
        user_id: Option<String>,
        deafened: bool,
    },
    SetVideo {
        room: String,
        #[serde(default)]
        user_id: Option<String>,
        enabled: bool,
    },
    SetStageStatus {
        room: String,
        #[serde(default)]
        user_id: Option<String>,
        /// `null` clears the override.
        #[serde(default)]
        status: Option<String>,
    },
    RaiseHand {
        room: String,
        #[serde(default)]
        user_id: Option<String>,
        raised: bool,
    },
    QualityReport {
        room: String,
        metrics: Map<String, Value>,
    },
    Recording {
        room: String,
        active: bool,
    },
    Signal {
        room: String,
        signal: SignalPayload,
    },
    Ping,
}

impl Command {
    /// Metric label.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Command::Join { .. } => "join",
            Command::Leave { .. } => "leave",
            Command::UpdatePresence { .. } => "update_presence",
            Command::Typing { .. } => "typing",
            Command::VoiceJoin { .. } => "voice_join",
            Command::VoiceLeave { .. } => "voice_leave",
            Command::SetRole { .. } => "set_role",
            Command::SetMuted { .. } => "set_muted",
            Command::SetDeafened { .. } => "set_deafened",
            Command::SetVideo { .. } => "set_video",
            Command::SetStageStatus { .. } => "set_stage_status",
            Command::RaiseHand { .. } => "raise_hand",
            Command::QualityReport { .. } => "quality_report",
            Command::Recording { .. } => "recording",
            Command::Signal { .. } => "signal",
            Command::Ping => "ping",
        }
    }
}
