//! Voice room data model.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::VoiceError;
use crate::connection::Connection;

/// Participant role in a voice room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Speaker,
    Listener,
}

impl Role {
    /// Parse a configured role, treating anything but `speaker` as
    /// `listener`.
    #[must_use]
    pub fn clamp(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("speaker") {
            Role::Speaker
        } else {
            Role::Listener
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Speaker => "speaker",
            Role::Listener => "listener",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "speaker" => Ok(Role::Speaker),
            "listener" => Ok(Role::Listener),
            other => Err(VoiceError::InvalidRole(other.to_string())),
        }
    }
}

/// Stage speaking state shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Listener,
    Invited,
    Requesting,
    Backstage,
    Live,
    Muted,
}

impl StageStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Listener => "listener",
            StageStatus::Invited => "invited",
            StageStatus::Requesting => "requesting",
            StageStatus::Backstage => "backstage",
            StageStatus::Live => "live",
            StageStatus::Muted => "muted",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "listener" => Ok(StageStatus::Listener),
            "invited" => Ok(StageStatus::Invited),
            "requesting" => Ok(StageStatus::Requesting),
            "backstage" => Ok(StageStatus::Backstage),
            "live" => Ok(StageStatus::Live),
            "muted" => Ok(StageStatus::Muted),
            other => Err(VoiceError::InvalidStageStatus(other.to_string())),
        }
    }
}

/// Role of the user performing a mutation, as resolved by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    #[default]
    Member,
    Moderator,
    Admin,
    Owner,
}

impl ActorRole {
    /// Whether this role may mutate other participants.
    #[must_use]
    pub fn is_elevated(&self) -> bool {
        !matches!(self, ActorRole::Member)
    }
}

impl FromStr for ActorRole {
    type Err = std::convert::Infallible;

    /// Unknown roles are plain members.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "moderator" | "mod" => ActorRole::Moderator,
            "admin" => ActorRole::Admin,
            "owner" => ActorRole::Owner,
            _ => ActorRole::Member,
        })
    }
}

/// Who is performing a mutation.
#[derive(Debug, Clone, Copy)]
pub struct Actor<'a> {
    pub user_id: &'a str,
    pub role: ActorRole,
}

impl<'a> Actor<'a> {
    #[must_use]
    pub fn new(user_id: &'a str, role: ActorRole) -> Self {
        Self { user_id, role }
    }

    /// The participant acting on themselves.
    #[must_use]
    pub fn this(user_id: &'a str) -> Self {
        Self::new(user_id, ActorRole::Member)
    }

    /// Check that this actor may mutate `target`.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::InsufficientPermission`] for a non-elevated
    /// actor targeting someone else.
    pub fn authorize(&self, target: &str) -> Result<(), VoiceError> {
        if self.user_id == target || self.role.is_elevated() {
            Ok(())
        } else {
            Err(VoiceError::InsufficientPermission)
        }
    }
}

/// Stage status from role and mute state, unless an override is pinned.
#[must_use]
pub fn derive_stage_status(
    role: Role,
    muted: bool,
    deafened: bool,
    stage_override: Option<StageStatus>,
) -> StageStatus {
    if let Some(status) = stage_override {
        return status;
    }
    match role {
        Role::Listener => StageStatus::Listener,
        Role::Speaker if deafened => StageStatus::Backstage,
        Role::Speaker if muted => StageStatus::Muted,
        Role::Speaker => StageStatus::Live,
    }
}

/// Merge a quality report into `current`, one track at a time. A track in
/// `report` replaces that track's previous metrics; other tracks are kept.
pub fn merge_quality(current: &mut Map<String, Value>, report: Map<String, Value>) {
    for (track, metrics) in report {
        current.insert(track, metrics);
    }
}

/// Recording flag for a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingState {
    pub active: bool,
    /// Milliseconds since the epoch of the last change.
    pub timestamp: u64,
    #[serde(default)]
    pub by: Option<String>,
}

/// A participant registered on this node.
pub struct ParticipantState {
    pub connection: Arc<dyn Connection>,
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
    pub muted: bool,
    pub deafened: bool,
    pub video_enabled: bool,
    pub stage_override: Option<StageStatus>,
    pub hand_raised: bool,
    pub last_quality: Map<String, Value>,
}

impl ParticipantState {
    #[must_use]
    pub fn new(
        connection: Arc<dyn Connection>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            connection,
            user_id: user_id.into(),
            display_name: display_name.into(),
            role,
            muted: false,
            deafened: false,
            video_enabled: false,
            stage_override: None,
            hand_raised: false,
            last_quality: Map::new(),
        }
    }

    #[must_use]
    pub fn stage_status(&self) -> StageStatus {
        derive_stage_status(self.role, self.muted, self.deafened, self.stage_override)
    }

    /// Serializable view, without the connection handle.
    #[must_use]
    pub fn view(&self) -> ParticipantView {
        ParticipantView {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            muted: self.muted,
            deafened: self.deafened,
            video_enabled: self.video_enabled,
            stage_status: self.stage_status(),
            stage_override: self.stage_override,
            hand_raised: self.hand_raised,
            quality: self.last_quality.clone(),
        }
    }
}

impl fmt::Debug for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticipantState")
            .field("connection", self.connection.id())
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("stage_status", &self.stage_status())
            .finish_non_exhaustive()
    }
}

/// Participant as seen by clients and other nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantView {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
    pub muted: bool,
    pub deafened: bool,
    pub video_enabled: bool,
    pub stage_status: StageStatus,
    #[serde(default)]
    pub stage_override: Option<StageStatus>,
    pub hand_raised: bool,
    #[serde(default)]
    pub quality: Map<String, Value>,
}

/// Room counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStats {
    pub total: usize,
    pub speakers: usize,
    pub listeners: usize,
    /// Speakers that are live right now.
    #[serde(rename = "activeSpeakers")]
    pub active_speakers: usize,
}

impl RoomStats {
    #[must_use]
    pub fn compute(participants: &[ParticipantView]) -> Self {
        let speakers = participants
            .iter()
            .filter(|p| p.role == Role::Speaker)
            .count();
        Self {
            total: participants.len(),
            speakers,
            listeners: participants.len() - speakers,
            active_speakers: participants
                .iter()
                .filter(|p| p.role == Role::Speaker && p.stage_status == StageStatus::Live)
                .count(),
        }
    }
}

/// Complete room view sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room: String,
    pub participants: Vec<ParticipantView>,
    pub stats: RoomStats,
    #[serde(default)]
    pub recording: Option<RecordingState>,
}

/// Participants this node hosts in one room.
#[derive(Debug, Default)]
pub struct RoomVoiceState {
    pub participants: HashMap<String, ParticipantState>,
    pub recording: Option<RecordingState>,
    /// Milliseconds since the epoch when the first participant arrived.
    pub created_at: u64,
}

/// Another node's last published view of a room.
#[derive(Debug, Clone, Default)]
pub struct RemoteRoomView {
    pub participants: Vec<ParticipantView>,
    pub recording: Option<RecordingState>,
}
