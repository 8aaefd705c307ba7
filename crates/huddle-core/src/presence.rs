//! Channel presence.
//!
//! A user is online in a channel while at least one of their sockets on any
//! node has joined it. Each node tracks its own sockets per user and keeps
//! the users announced by every other node under that node's id, so a leave
//! from one node never hides a user another node still reports.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use huddle_broker::BrokerTransport;
use huddle_protocol::{topics, Envelope, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionId, ConnectionManager};
use crate::replicate::{ReplicaSink, Replicator};

fn default_status() -> String {
    "online".to_string()
}

/// One user's presence in a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub display_name: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl PresenceEntry {
    #[must_use]
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            status: default_status(),
            avatar_url: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    #[must_use]
    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }
}

/// A user with at least one socket on this node.
#[derive(Debug)]
struct LocalUser {
    entry: PresenceEntry,
    sockets: HashSet<ConnectionId>,
}

/// Presence for one channel on this node.
#[derive(Debug, Default)]
struct ChannelPresence {
    local: HashMap<String, LocalUser>,
    /// Users announced by other nodes, keyed by origin node id.
    remote: HashMap<String, HashMap<String, PresenceEntry>>,
}

impl ChannelPresence {
    fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }

    fn contains(&self, user_id: &str) -> bool {
        self.local.contains_key(user_id) || self.remote.values().any(|users| users.contains_key(user_id))
    }

    /// Overwrite every copy of the user's display fields. Returns `true` if
    /// the user is present at all.
    fn overwrite(&mut self, entry: &PresenceEntry) -> bool {
        let mut found = false;
        if let Some(user) = self.local.get_mut(&entry.user_id) {
            user.entry = entry.clone();
            found = true;
        }
        for users in self.remote.values_mut() {
            if let Some(existing) = users.get_mut(&entry.user_id) {
                *existing = entry.clone();
                found = true;
            }
        }
        found
    }

    fn snapshot(&self) -> Vec<PresenceEntry> {
        let mut merged: HashMap<&str, &PresenceEntry> = HashMap::new();
        for users in self.remote.values() {
            for (user_id, entry) in users {
                merged.entry(user_id.as_str()).or_insert(entry);
            }
        }
        for (user_id, user) in &self.local {
            merged.insert(user_id.as_str(), &user.entry);
        }

        let mut users: Vec<PresenceEntry> = merged.into_values().cloned().collect();
        users.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        users
    }
}

/// Outcome of attaching a local socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Joined {
    /// First socket for the user in the channel on this node.
    pub first_local: bool,
    /// The user was not online anywhere in the channel before.
    pub came_online: bool,
}

/// A user's last local socket left a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub entry: PresenceEntry,
    /// No other node still reports the user in the channel.
    pub went_offline: bool,
}

/// Presence state for every channel this node has seen.
///
/// Local sockets are counted per user. Other nodes' users are kept per
/// origin node, so a user stays online here for as long as any node still
/// reports them.
#[derive(Debug, Default)]
pub struct PresenceStore {
    channels: DashMap<String, ChannelPresence>,
}

impl PresenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a local socket. The entry's display fields replace every copy
    /// of the user in the channel.
    pub fn add_connection(&self, channel_id: &str, entry: PresenceEntry, conn: ConnectionId) -> Joined {
        let mut channel = self.channels.entry(channel_id.to_string()).or_default();
        let came_online = !channel.contains(&entry.user_id);
        channel.overwrite(&entry);

        let user = channel
            .local
            .entry(entry.user_id.clone())
            .or_insert_with(|| LocalUser {
                entry: entry.clone(),
                sockets: HashSet::new(),
            });
        let first_local = user.sockets.is_empty();
        user.sockets.insert(conn);
        user.entry = entry;

        Joined {
            first_local,
            came_online,
        }
    }

    /// Detach a local socket. Returns a [`Departure`] if this was the
    /// user's last local socket in the channel.
    pub fn remove_connection(&self, channel_id: &str, user_id: &str, conn: &ConnectionId) -> Option<Departure> {
        let departure = {
            let mut channel = self.channels.get_mut(channel_id)?;
            let user = channel.local.get_mut(user_id)?;
            if !user.sockets.remove(conn) || !user.sockets.is_empty() {
                None
            } else {
                let user = channel.local.remove(user_id)?;
                Some(Departure {
                    entry: user.entry,
                    went_offline: !channel.contains(user_id),
                })
            }
        };
        self.channels.remove_if(channel_id, |_, c| c.is_empty());
        departure
    }

    /// Detach a socket from every channel. Returns `(channel, departure)`
    /// for each channel the user has no local sockets left in.
    pub fn remove_connection_everywhere(&self, conn: &ConnectionId) -> Vec<(String, Departure)> {
        let memberships: Vec<(String, String)> = self
            .channels
            .iter()
            .flat_map(|channel| {
                channel
                    .local
                    .iter()
                    .filter(|(_, user)| user.sockets.contains(conn))
                    .map(|(user_id, _)| (channel.key().clone(), user_id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        memberships
            .into_iter()
            .filter_map(|(channel_id, user_id)| {
                self.remove_connection(&channel_id, &user_id, conn)
                    .map(|departure| (channel_id, departure))
            })
            .collect()
    }

    /// Replace the display fields of `entry.user_id` wherever it is present.
    /// Returns `(channel, has_local_sockets)` for each affected channel.
    pub fn update_user(&self, entry: &PresenceEntry) -> Vec<(String, bool)> {
        let mut affected = Vec::new();
        for mut channel in self.channels.iter_mut() {
            if channel.overwrite(entry) {
                let local = channel.local.contains_key(&entry.user_id);
                affected.push((channel.key().clone(), local));
            }
        }
        affected.sort();
        affected
    }

    /// Record a user reported by `origin`. Display fields replace every
    /// copy of the user. Returns `true` if the user came online.
    pub fn apply_remote(&self, channel_id: &str, origin: &str, entry: PresenceEntry) -> bool {
        let mut channel = self.channels.entry(channel_id.to_string()).or_default();
        let came_online = !channel.contains(&entry.user_id);
        channel.overwrite(&entry);
        channel
            .remote
            .entry(origin.to_string())
            .or_default()
            .insert(entry.user_id.clone(), entry);
        came_online
    }

    /// Forget a user reported by `origin`. Returns `true` if no node reports
    /// the user any more.
    pub fn remove_remote(&self, channel_id: &str, origin: &str, user_id: &str) -> bool {
        let went_offline = match self.channels.get_mut(channel_id) {
            Some(mut channel) => {
                let (removed, emptied) = channel
                    .remote
                    .get_mut(origin)
                    .map(|users| (users.remove(user_id).is_some(), users.is_empty()))
                    .unwrap_or((false, false));
                if emptied {
                    channel.remote.remove(origin);
                }
                removed && !channel.contains(user_id)
            }
            None => false,
        };
        self.channels.remove_if(channel_id, |_, c| c.is_empty());
        went_offline
    }

    /// Users online in a channel, ordered by display name.
    #[must_use]
    pub fn snapshot(&self, channel_id: &str) -> Vec<PresenceEntry> {
        self.channels
            .get(channel_id)
            .map(|channel| channel.snapshot())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_online(&self, channel_id: &str, user_id: &str) -> bool {
        self.channels
            .get(channel_id)
            .map(|channel| channel.contains(user_id))
            .unwrap_or(false)
    }

    /// Number of channels with any presence.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Local fan-out topic for a channel's presence.
#[must_use]
pub fn presence_topic(channel_id: &str) -> String {
    format!("presence:{channel_id}")
}

fn presence_event(
    action: &str,
    channel_id: &str,
    user: &PresenceEntry,
    users: &[PresenceEntry],
) -> Value {
    json!({
        "type": "presence",
        "action": action,
        "channel_id": channel_id,
        "user": user,
        "users": users,
    })
}

fn presence_envelope(action: &str, channel_id: &str, user: &PresenceEntry) -> Result<Envelope, ProtocolError> {
    Envelope::for_channel(action, channel_id).with("user", user)
}

/// Tracks who is online in each channel and keeps every node in agreement.
pub struct PresenceManager {
    store: PresenceStore,
    connections: Arc<ConnectionManager>,
    replicator: Replicator,
}

impl PresenceManager {
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        connections: Arc<ConnectionManager>,
        transport: Arc<BrokerTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: PresenceStore::new(),
            connections,
            replicator: Replicator::new(node_id, topics::PRESENCE, transport),
        })
    }

    /// Begin receiving presence from other nodes.
    pub async fn start(self: &Arc<Self>) {
        self.replicator.attach(self).await;
    }

    /// Stop receiving presence from other nodes.
    pub async fn stop(&self) {
        self.replicator.detach().await;
    }

    /// Join `conn` to `channel_id` as `entry`.
    ///
    /// The joining socket always receives the channel snapshot. Local
    /// sockets hear a join only when the user was not already online, and
    /// other nodes only on the user's first socket here. Returns whether
    /// this is the user's first socket in the channel on this node.
    pub async fn join(&self, channel_id: &str, conn: Arc<dyn Connection>, entry: PresenceEntry) -> bool {
        let topic = presence_topic(channel_id);
        self.connections.connect(&topic, Arc::clone(&conn));
        let joined = self
            .store
            .add_connection(channel_id, entry.clone(), conn.id().clone());
        let users = self.store.snapshot(channel_id);

        let snapshot = json!({
            "type": "presence_snapshot",
            "channel_id": channel_id,
            "users": users,
        });
        self.connections.send_to(&topic, conn.as_ref(), &snapshot).await;

        if joined.came_online {
            debug!(channel = %channel_id, user = %entry.user_id, "User came online");
            let event = presence_event("join", channel_id, &entry, &users);
            self.connections
                .broadcast(&topic, &event, std::slice::from_ref(conn.id()))
                .await;
        }
        if joined.first_local {
            self.replicate("join", channel_id, &entry).await;
        }
        joined.first_local
    }

    /// Detach one socket. Returns `true` if it was the user's last socket in
    /// the channel on this node.
    pub async fn leave(&self, channel_id: &str, conn_id: &ConnectionId, user_id: &str) -> bool {
        self.connections.disconnect(&presence_topic(channel_id), conn_id);
        match self.store.remove_connection(channel_id, user_id, conn_id) {
            Some(departure) => {
                self.announce_leave(channel_id, &departure).await;
                true
            }
            None => false,
        }
    }

    /// Detach a closed socket from every channel. Returns the channels in
    /// which it was its user's last local socket.
    pub async fn leave_all(&self, conn_id: &ConnectionId) -> Vec<String> {
        let departed = self.store.remove_connection_everywhere(conn_id);
        let mut channels = Vec::with_capacity(departed.len());
        for (channel_id, departure) in departed {
            self.connections.disconnect(&presence_topic(&channel_id), conn_id);
            self.announce_leave(&channel_id, &departure).await;
            channels.push(channel_id);
        }
        self.connections.disconnect_all(conn_id);
        channels
    }

    /// Push new display fields for a user to every channel they occupy.
    /// Returns the number of channels updated.
    ///
    /// Only channels where the user has sockets on this node are
    /// replicated; the nodes hosting their other sockets announce those.
    pub async fn refresh_user(&self, entry: PresenceEntry) -> usize {
        let channels = self.store.update_user(&entry);
        for (channel_id, local) in &channels {
            let users = self.store.snapshot(channel_id);
            let event = presence_event("update", channel_id, &entry, &users);
            self.connections
                .broadcast(&presence_topic(channel_id), &event, &[])
                .await;
            if *local {
                self.replicate("update", channel_id, &entry).await;
            }
        }
        channels.len()
    }

    /// Users online in a channel, ordered by display name.
    #[must_use]
    pub fn snapshot(&self, channel_id: &str) -> Vec<PresenceEntry> {
        self.store.snapshot(channel_id)
    }

    #[must_use]
    pub fn is_online(&self, channel_id: &str, user_id: &str) -> bool {
        self.store.is_online(channel_id, user_id)
    }

    async fn announce_leave(&self, channel_id: &str, departure: &Departure) {
        let entry = &departure.entry;
        if departure.went_offline {
            debug!(channel = %channel_id, user = %entry.user_id, "User went offline");
            let users = self.store.snapshot(channel_id);
            let event = presence_event("leave", channel_id, entry, &users);
            self.connections
                .broadcast(&presence_topic(channel_id), &event, &[])
                .await;
        }
        self.replicate("leave", channel_id, entry).await;
    }

    async fn replicate(&self, action: &str, channel_id: &str, entry: &PresenceEntry) {
        match presence_envelope(action, channel_id, entry) {
            Ok(envelope) => {
                self.replicator.publish(envelope).await;
            }
            Err(e) => warn!(channel = %channel_id, error = %e, "Presence envelope build failed"),
        }
    }

    async fn apply(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let channel_id = envelope
            .channel_id
            .as_deref()
            .ok_or_else(|| ProtocolError::MissingField("channel_id".to_string()))?;
        let origin = envelope
            .origin
            .as_deref()
            .ok_or_else(|| ProtocolError::MissingField("origin".to_string()))?;
        let entry: PresenceEntry = envelope.field("user")?;

        let changed = match envelope.action.as_str() {
            "join" => self.store.apply_remote(channel_id, origin, entry.clone()),
            "update" => {
                self.store.apply_remote(channel_id, origin, entry.clone());
                true
            }
            "leave" => self.store.remove_remote(channel_id, origin, &entry.user_id),
            other => return Err(ProtocolError::Invalid(format!("unknown presence action {other}"))),
        };

        if changed {
            let users = self.store.snapshot(channel_id);
            let event = presence_event(&envelope.action, channel_id, &entry, &users);
            self.connections
                .broadcast(&presence_topic(channel_id), &event, &[])
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicaSink for PresenceManager {
    async fn apply_remote(&self, envelope: Envelope) {
        if let Err(e) = self.apply(&envelope).await {
            warn!(action = %envelope.action, error = %e, "Ignoring presence envelope");
        }
    }
}
