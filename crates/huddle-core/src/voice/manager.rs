use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use huddle_broker::BrokerTransport;
use huddle_protocol::{topics, Envelope, ProtocolError};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::signal::{signal_event, SignalPayload};
use super::state::{
    merge_quality, Actor, ParticipantState, ParticipantView, RecordingState, RemoteRoomView, Role,
    RoomSnapshot, RoomStats, RoomVoiceState, StageStatus,
};
use super::webhook::WebhookNotifier;
use super::{Mutation, VoiceError};
use crate::connection::{Connection, ConnectionId, ConnectionManager, DeliveryReport};
use crate::metrics;
use crate::replicate::{ReplicaSink, Replicator};

/// How long shutdown waits for in-flight webhooks.
const WEBHOOK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Local fan-out topic for a voice room.
#[must_use]
pub fn voice_topic(room: &str) -> String {
    format!("voice:{room}")
}

/// Voice room policy.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Maximum speakers per room across the cluster. `None` is unlimited.
    pub max_speakers: Option<usize>,
    /// Role for new participants.
    pub default_role: Role,
    /// Make the first participant a speaker when the room has none.
    pub auto_promote_first_speaker: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            max_speakers: None,
            default_role: Role::Listener,
            auto_promote_first_speaker: true,
        }
    }
}

/// A computed room view ready to send.
struct Publication {
    snapshot: RoomSnapshot,
    local: Vec<ParticipantView>,
    recording: Option<RecordingState>,
}

#[derive(Default)]
struct Rooms {
    local: HashMap<String, RoomVoiceState>,
    /// Room -> origin node -> that node's last published view.
    remote: HashMap<String, HashMap<String, RemoteRoomView>>,
}

fn by_display_name(a: &ParticipantView, b: &ParticipantView) -> std::cmp::Ordering {
    a.display_name
        .to_lowercase()
        .cmp(&b.display_name.to_lowercase())
        .then_with(|| a.user_id.cmp(&b.user_id))
}

impl Rooms {
    fn local_views(&self, room: &str) -> Vec<ParticipantView> {
        let mut views: Vec<ParticipantView> = self
            .local
            .get(room)
            .map(|state| state.participants.values().map(ParticipantState::view).collect())
            .unwrap_or_default();
        views.sort_by(by_display_name);
        views
    }

    /// Local participants merged with every remote node's view. A user
    /// hosted here wins over a stale remote copy.
    fn views(&self, room: &str) -> Vec<ParticipantView> {
        let mut views = self.local_views(room);
        let mut seen: HashSet<String> = views.iter().map(|p| p.user_id.clone()).collect();

        if let Some(remotes) = self.remote.get(room) {
            let mut nodes: Vec<_> = remotes.iter().collect();
            nodes.sort_by(|a, b| a.0.cmp(b.0));
            for (_, view) in nodes {
                for participant in &view.participants {
                    if seen.insert(participant.user_id.clone()) {
                        views.push(participant.clone());
                    }
                }
            }
        }

        views.sort_by(by_display_name);
        views
    }

    fn speaker_count(&self, room: &str) -> usize {
        self.views(room)
            .iter()
            .filter(|p| p.role == Role::Speaker)
            .count()
    }

    fn local_recording(&self, room: &str) -> Option<RecordingState> {
        self.local.get(room).and_then(|state| state.recording.clone())
    }

    /// Most recent recording state known anywhere in the cluster.
    fn recording(&self, room: &str) -> Option<RecordingState> {
        let remote = self
            .remote
            .get(room)
            .into_iter()
            .flat_map(|nodes| nodes.values())
            .filter_map(|view| view.recording.clone());
        self.local_recording(room)
            .into_iter()
            .chain(remote)
            .max_by_key(|state| state.timestamp)
    }

    fn snapshot(&self, room: &str) -> RoomSnapshot {
        let participants = self.views(room);
        RoomSnapshot {
            room: room.to_string(),
            stats: RoomStats::compute(&participants),
            participants,
            recording: self.recording(room),
        }
    }

    fn publication(&self, room: &str) -> Publication {
        Publication {
            snapshot: self.snapshot(room),
            local: self.local_views(room),
            recording: self.local_recording(room),
        }
    }

    fn apply<F>(&mut self, room: &str, target: &str, actor: Actor<'_>, apply: F) -> Result<Mutation, VoiceError>
    where
        F: FnOnce(&mut ParticipantState, usize) -> Result<bool, VoiceError>,
    {
        if !self.local.contains_key(room) {
            return Err(VoiceError::RoomNotFound(room.to_string()));
        }
        actor.authorize(target)?;

        let speakers = self.speaker_count(room);
        let participant = self
            .local
            .get_mut(room)
            .and_then(|state| state.participants.get_mut(target))
            .ok_or_else(|| VoiceError::ParticipantNotFound(target.to_string()))?;

        let changed = apply(participant, speakers)?;
        Ok(Mutation {
            participant: participant.view(),
            changed,
        })
    }
}

fn state_event(snapshot: &RoomSnapshot) -> Value {
    json!({
        "type": "voice_state",
        "room": snapshot.room,
        "participants": snapshot.participants,
        "stats": snapshot.stats,
        "recording": snapshot.recording,
    })
}

/// Single writer for voice room state on this node.
///
/// Every mutation runs under one lock that covers validation, the change
/// and snapshot computation; the lock is released before anything is sent.
pub struct VoiceSignalManager {
    config: VoiceConfig,
    rooms: Mutex<Rooms>,
    connections: Arc<ConnectionManager>,
    replicator: Replicator,
    webhooks: WebhookNotifier,
}

impl VoiceSignalManager {
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        config: VoiceConfig,
        connections: Arc<ConnectionManager>,
        transport: Arc<BrokerTransport>,
        webhooks: WebhookNotifier,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            rooms: Mutex::new(Rooms::default()),
            connections,
            replicator: Replicator::new(node_id, topics::VOICE, transport),
            webhooks,
        })
    }

    #[must_use]
    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    /// Begin receiving room state from other nodes.
    pub async fn start(self: &Arc<Self>) {
        self.replicator.attach(self).await;
    }

    /// Stop receiving remote state and wait for pending webhooks.
    pub async fn stop(&self) {
        self.replicator.detach().await;
        self.webhooks.drain(WEBHOOK_DRAIN_TIMEOUT).await;
    }

    fn initial_role(&self, speakers: usize) -> Role {
        let role = if self.config.auto_promote_first_speaker && speakers == 0 {
            Role::Speaker
        } else {
            self.config.default_role
        };
        let full = self.config.max_speakers.is_some_and(|max| speakers >= max);
        if role == Role::Speaker && full {
            Role::Listener
        } else {
            role
        }
    }

    /// Join `conn` to `room`. Registering a user who is already present
    /// moves them to the new connection and keeps their state.
    pub async fn register(
        &self,
        room: &str,
        conn: Arc<dyn Connection>,
        user_id: &str,
        display_name: &str,
    ) -> Mutation {
        let (mutation, replaced, publication) = {
            let mut rooms = self.rooms.lock().await;
            let speakers = rooms.speaker_count(room);
            let role = self.initial_role(speakers);
            let state = rooms
                .local
                .entry(room.to_string())
                .or_insert_with(|| RoomVoiceState {
                    created_at: now_ms(),
                    ..RoomVoiceState::default()
                });

            let (view, replaced) = match state.participants.get_mut(user_id) {
                Some(existing) => {
                    let previous = std::mem::replace(&mut existing.connection, Arc::clone(&conn));
                    existing.display_name = display_name.to_string();
                    let replaced = (previous.id() != conn.id()).then(|| previous.id().clone());
                    (existing.view(), replaced)
                }
                None => {
                    let participant =
                        ParticipantState::new(Arc::clone(&conn), user_id, display_name, role);
                    let view = participant.view();
                    state.participants.insert(user_id.to_string(), participant);
                    (view, None)
                }
            };

            let mutation = Mutation {
                participant: view,
                changed: true,
            };
            (mutation, replaced, rooms.publication(room))
        };

        let topic = voice_topic(room);
        if let Some(previous) = replaced {
            self.connections.disconnect(&topic, &previous);
        }
        self.connections.connect(&topic, conn);
        debug!(room = %room, user = %user_id, role = %mutation.participant.role, "Voice participant registered");

        self.publish(publication).await;
        mutation
    }

    /// Remove a participant if `conn_id` is still their connection.
    /// Returns whether they were removed.
    pub async fn unregister(&self, room: &str, conn_id: &ConnectionId, user_id: &str) -> bool {
        let publication = {
            let mut rooms = self.rooms.lock().await;
            let removed = rooms
                .local
                .get_mut(room)
                .filter(|state| {
                    state
                        .participants
                        .get(user_id)
                        .is_some_and(|p| p.connection.id() == conn_id)
                })
                .map(|state| {
                    state.participants.remove(user_id);
                    state.participants.is_empty()
                });

            match removed {
                Some(now_empty) => {
                    if now_empty {
                        rooms.local.remove(room);
                    }
                    Some(rooms.publication(room))
                }
                None => None,
            }
        };

        self.connections.disconnect(&voice_topic(room), conn_id);
        match publication {
            Some(publication) => {
                debug!(room = %room, user = %user_id, "Voice participant unregistered");
                self.publish(publication).await;
                true
            }
            None => false,
        }
    }

    /// Unregister a closed connection from every room. Returns the rooms it
    /// left.
    pub async fn unregister_connection(&self, conn_id: &ConnectionId) -> Vec<String> {
        let memberships: Vec<(String, String)> = {
            let rooms = self.rooms.lock().await;
            rooms
                .local
                .iter()
                .flat_map(|(room, state)| {
                    state
                        .participants
                        .values()
                        .filter(|p| p.connection.id() == conn_id)
                        .map(|p| (room.clone(), p.user_id.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        let mut left = Vec::with_capacity(memberships.len());
        for (room, user_id) in memberships {
            if self.unregister(&room, conn_id, &user_id).await {
                left.push(room);
            }
        }
        left
    }

    /// Change a participant's role. Promotion fails at the speaker cap;
    /// any role change clears a pinned stage status and a raised hand.
    pub async fn set_role(
        &self,
        room: &str,
        target: &str,
        role: Role,
        actor: Actor<'_>,
    ) -> Result<Mutation, VoiceError> {
        let max_speakers = self.config.max_speakers;
        self.mutate(room, target, actor, "set_role", move |p, speakers| {
            if p.role == role {
                return Ok(false);
            }
            if role == Role::Speaker {
                if let Some(max) = max_speakers.filter(|max| speakers >= *max) {
                    return Err(VoiceError::SpeakerLimitReached(max));
                }
            }
            p.role = role;
            p.stage_override = None;
            p.hand_raised = false;
            Ok(true)
        })
        .await
    }

    pub async fn set_muted(
        &self,
        room: &str,
        target: &str,
        muted: bool,
        actor: Actor<'_>,
    ) -> Result<Mutation, VoiceError> {
        self.mutate(room, target, actor, "set_muted", move |p, _| {
            Ok(std::mem::replace(&mut p.muted, muted) != muted)
        })
        .await
    }

    pub async fn set_deafened(
        &self,
        room: &str,
        target: &str,
        deafened: bool,
        actor: Actor<'_>,
    ) -> Result<Mutation, VoiceError> {
        self.mutate(room, target, actor, "set_deafened", move |p, _| {
            Ok(std::mem::replace(&mut p.deafened, deafened) != deafened)
        })
        .await
    }

    pub async fn set_video_state(
        &self,
        room: &str,
        target: &str,
        enabled: bool,
        actor: Actor<'_>,
    ) -> Result<Mutation, VoiceError> {
        self.mutate(room, target, actor, "set_video_state", move |p, _| {
            Ok(std::mem::replace(&mut p.video_enabled, enabled) != enabled)
        })
        .await
    }

    /// Pin a stage status, or clear the pin with `None` so the status is
    /// derived again.
    pub async fn set_stage_status(
        &self,
        room: &str,
        target: &str,
        status: Option<&str>,
        actor: Actor<'_>,
    ) -> Result<Mutation, VoiceError> {
        let status = match status.map(str::parse::<StageStatus>).transpose() {
            Ok(status) => status,
            Err(e) => return Err(Self::rejected(room, "set_stage_status", e)),
        };
        self.mutate(room, target, actor, "set_stage_status", move |p, _| {
            Ok(std::mem::replace(&mut p.stage_override, status) != status)
        })
        .await
    }

    /// Raise or lower a hand. A listener raising their hand is pinned to
    /// `requesting` until the hand is lowered or their role changes.
    pub async fn set_hand_raised(
        &self,
        room: &str,
        target: &str,
        raised: bool,
        actor: Actor<'_>,
    ) -> Result<Mutation, VoiceError> {
        self.mutate(room, target, actor, "set_hand_raised", move |p, _| {
            if p.hand_raised == raised {
                return Ok(false);
            }
            p.hand_raised = raised;
            if raised && p.role == Role::Listener && p.stage_override.is_none() {
                p.stage_override = Some(StageStatus::Requesting);
            } else if !raised && p.stage_override == Some(StageStatus::Requesting) {
                p.stage_override = None;
            }
            Ok(true)
        })
        .await
    }

    /// Merge a participant's self-reported quality metrics.
    pub async fn record_quality(
        &self,
        room: &str,
        user_id: &str,
        report: Map<String, Value>,
    ) -> Result<Mutation, VoiceError> {
        let notify = report.clone();
        let mutation = self
            .mutate(room, user_id, Actor::this(user_id), "record_quality", move |p, _| {
                let changed = !report.is_empty();
                merge_quality(&mut p.last_quality, report);
                Ok(changed)
            })
            .await?;

        if mutation.changed {
            self.webhooks.notify_quality(room, user_id, &notify).await;
        }
        Ok(mutation)
    }

    /// Start or stop recording a room.
    pub async fn set_recording_state(
        &self,
        room: &str,
        active: bool,
        actor: &str,
    ) -> Result<RecordingState, VoiceError> {
        let outcome = {
            let mut rooms = self.rooms.lock().await;
            match rooms.local.get_mut(room) {
                None => Err(VoiceError::RoomNotFound(room.to_string())),
                Some(state) => match state.recording.clone().filter(|r| r.active == active) {
                    Some(current) => Ok((current, None)),
                    None => {
                        let recording = RecordingState {
                            active,
                            timestamp: now_ms(),
                            by: Some(actor.to_string()),
                        };
                        state.recording = Some(recording.clone());
                        Ok((recording, Some(rooms.publication(room))))
                    }
                },
            }
        };

        let (recording, publication) =
            outcome.map_err(|e| Self::rejected(room, "set_recording_state", e))?;
        if let Some(publication) = publication {
            debug!(room = %room, active, by = %actor, "Recording state changed");
            self.publish(publication).await;
            self.webhooks.notify_recording(room, &recording).await;
        }
        Ok(recording)
    }

    /// Relay a signaling message to every other connection in the room and
    /// to other nodes.
    pub async fn relay_signal(
        &self,
        room: &str,
        from: &str,
        signal: SignalPayload,
        exclude: &[ConnectionId],
    ) -> DeliveryReport {
        let event = signal_event(room, from, &signal);
        let report = self
            .connections
            .broadcast(&voice_topic(room), &event, exclude)
            .await;

        let envelope = Envelope::for_room("signal", room)
            .with("from", from)
            .and_then(|e| e.with("signal", &signal));
        match envelope {
            Ok(envelope) => {
                self.replicator.publish(envelope).await;
            }
            Err(e) => warn!(room = %room, error = %e, "Signal envelope build failed"),
        }
        report
    }

    /// Complete room view, or `None` if nobody is in the room anywhere.
    pub async fn snapshot(&self, room: &str) -> Option<RoomSnapshot> {
        let rooms = self.rooms.lock().await;
        let snapshot = rooms.snapshot(room);
        (!snapshot.participants.is_empty()).then_some(snapshot)
    }

    /// One participant hosted on any node.
    pub async fn participant(&self, room: &str, user_id: &str) -> Option<ParticipantView> {
        let rooms = self.rooms.lock().await;
        rooms.views(room).into_iter().find(|p| p.user_id == user_id)
    }

    async fn mutate<F>(
        &self,
        room: &str,
        target: &str,
        actor: Actor<'_>,
        operation: &'static str,
        apply: F,
    ) -> Result<Mutation, VoiceError>
    where
        F: FnOnce(&mut ParticipantState, usize) -> Result<bool, VoiceError>,
    {
        let outcome = {
            let mut rooms = self.rooms.lock().await;
            rooms.apply(room, target, actor, apply).map(|mutation| {
                let publication = mutation.changed.then(|| rooms.publication(room));
                (mutation, publication)
            })
        };

        let (mutation, publication) = outcome.map_err(|e| Self::rejected(room, operation, e))?;
        if let Some(publication) = publication {
            debug!(room = %room, target = %target, operation, "Voice state changed");
            self.publish(publication).await;
        }
        Ok(mutation)
    }

    fn rejected(room: &str, operation: &'static str, error: VoiceError) -> VoiceError {
        metrics::record_voice_rejection(error.reason());
        debug!(room = %room, operation, error = %error, "Voice mutation rejected");
        error
    }

    async fn publish(&self, publication: Publication) {
        let room = publication.snapshot.room.clone();
        self.connections
            .broadcast(&voice_topic(&room), &state_event(&publication.snapshot), &[])
            .await;

        let envelope = Envelope::for_room("state", room.as_str())
            .with("participants", &publication.local)
            .and_then(|e| e.with("recording", &publication.recording));
        match envelope {
            Ok(envelope) => {
                self.replicator.publish(envelope).await;
            }
            Err(e) => warn!(room = %room, error = %e, "Voice envelope build failed"),
        }
    }

    async fn apply(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let room = envelope
            .room
            .as_deref()
            .ok_or_else(|| ProtocolError::MissingField("room".to_string()))?;

        match envelope.action.as_str() {
            "state" => {
                let origin = envelope
                    .origin
                    .clone()
                    .ok_or_else(|| ProtocolError::MissingField("origin".to_string()))?;
                let participants: Vec<ParticipantView> =
                    envelope.optional_field("participants")?.unwrap_or_default();
                let recording: Option<RecordingState> = envelope.optional_field("recording")?;

                let snapshot = {
                    let mut rooms = self.rooms.lock().await;
                    if participants.is_empty() && recording.is_none() {
                        if let Some(nodes) = rooms.remote.get_mut(room) {
                            nodes.remove(&origin);
                            if nodes.is_empty() {
                                rooms.remote.remove(room);
                            }
                        }
                    } else {
                        rooms.remote.entry(room.to_string()).or_default().insert(
                            origin,
                            RemoteRoomView {
                                participants,
                                recording,
                            },
                        );
                    }
                    rooms.snapshot(room)
                };

                self.connections
                    .broadcast(&voice_topic(room), &state_event(&snapshot), &[])
                    .await;
            }
            "signal" => {
                let from: String = envelope.field("from")?;
                let signal: SignalPayload = envelope.field("signal")?;
                self.connections
                    .broadcast(&voice_topic(room), &signal_event(room, &from, &signal), &[])
                    .await;
            }
            other => {
                return Err(ProtocolError::Invalid(format!("unknown voice action {other}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicaSink for VoiceSignalManager {
    async fn apply_remote(&self, envelope: Envelope) {
        if let Err(e) = self.apply(&envelope).await {
            warn!(action = %envelope.action, error = %e, "Ignoring voice envelope");
        }
    }
}
