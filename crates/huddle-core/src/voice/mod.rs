//! Voice and stage coordination.
//!
//! [`VoiceSignalManager`] owns per-room participant state, relays WebRTC
//! signaling between participants, and publishes a complete room snapshot
//! after every change.

mod manager;
pub mod signal;
pub mod state;
pub mod webhook;

use thiserror::Error;

pub use manager::{voice_topic, VoiceConfig, VoiceSignalManager};
pub use signal::SignalPayload;
pub use state::{
    derive_stage_status, merge_quality, Actor, ActorRole, ParticipantView, RecordingState, Role,
    RoomSnapshot, RoomStats, StageStatus,
};
pub use webhook::{WebhookConfig, WebhookNotifier};

/// Rejected voice mutation. Nothing was changed or broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoiceError {
    #[error("Insufficient permission to modify another participant")]
    InsufficientPermission,

    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("Voice room not found: {0}")]
    RoomNotFound(String),

    #[error("Speaker limit reached ({0})")]
    SpeakerLimitReached(usize),

    #[error("Invalid stage status: {0}")]
    InvalidStageStatus(String),

    #[error("Invalid role: {0}")]
    InvalidRole(String),
}

impl VoiceError {
    /// Metric label for this error.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            VoiceError::InsufficientPermission => "permission",
            VoiceError::ParticipantNotFound(_) => "participant_not_found",
            VoiceError::RoomNotFound(_) => "room_not_found",
            VoiceError::SpeakerLimitReached(_) => "speaker_limit",
            VoiceError::InvalidStageStatus(_) => "invalid_stage_status",
            VoiceError::InvalidRole(_) => "invalid_role",
        }
    }
}

/// Result of an accepted mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// The target participant after the mutation.
    pub participant: ParticipantView,
    /// Whether anything changed. Unchanged mutations are not broadcast.
    pub changed: bool,
}
