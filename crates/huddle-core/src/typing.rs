//! Typing indicators.
//!
//! Entries expire a fixed TTL after the last `typing = true` from their
//! user. Expiry is logical: every read and write sweeps the channel first,
//! and an optional sweeper task does the same on an interval so idle
//! channels still announce expiries.
//!
//! Each node owns the indicators of the users typing through it. Replication
//! is replace-by-snapshot per origin: every event carries the publishing
//! node's own typists and receivers swap out their copy of that node's set.
//! A node only announces expiry of its own entries, so a peer whose copy
//! runs out first never clears an indicator its owner has refreshed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use huddle_broker::BrokerTransport;
use huddle_protocol::{topics, Envelope, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::ConnectionManager;
use crate::replicate::{ReplicaSink, Replicator};

/// Default time an indicator stays up without a refresh.
pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(8);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A user currently typing in a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingEntry {
    pub user_id: String,
    pub display_name: String,
    /// Wall-clock milliseconds of the last refresh.
    pub started_at: u64,
    #[serde(skip, default = "Instant::now")]
    expires_at: Instant,
}

impl PartialEq for TypingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.user_id == other.user_id
            && self.display_name == other.display_name
            && self.started_at == other.started_at
    }
}

impl TypingEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

fn retain_live(entries: &mut HashMap<String, TypingEntry>, now: Instant) -> bool {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    entries.len() != before
}

fn sorted(mut entries: Vec<TypingEntry>) -> Vec<TypingEntry> {
    entries.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    entries
}

#[derive(Debug, Default)]
struct ChannelTyping {
    local: HashMap<String, TypingEntry>,
    /// Other nodes' typists, keyed by origin node id.
    remote: HashMap<String, HashMap<String, TypingEntry>>,
}

impl ChannelTyping {
    fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }

    fn contains(&self, user_id: &str) -> bool {
        self.local.contains_key(user_id) || self.remote.values().any(|users| users.contains_key(user_id))
    }
}

/// Which views a sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Swept {
    /// Entries owned by this node expired.
    pub local: bool,
    /// Entries copied from other nodes expired.
    pub remote: bool,
}

impl Swept {
    #[must_use]
    pub fn any(&self) -> bool {
        self.local || self.remote
    }
}

/// Typing state for every channel on this node.
#[derive(Debug)]
pub struct TypingStore {
    ttl: Duration,
    channels: DashMap<String, ChannelTyping>,
}

impl TypingStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            channels: DashMap::new(),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mark a user as typing through this node. Returns `true` if they were
    /// not already; a refresh only extends the TTL.
    pub fn start(&self, channel_id: &str, user_id: &str, display_name: &str) -> bool {
        let now = Instant::now();
        let mut channel = self.channels.entry(channel_id.to_string()).or_default();
        if let Some(entry) = channel.local.get_mut(user_id).filter(|e| !e.is_expired(now)) {
            entry.display_name = display_name.to_string();
            entry.started_at = now_ms();
            entry.expires_at = now + self.ttl;
            return false;
        }

        channel.local.insert(
            user_id.to_string(),
            TypingEntry {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                started_at: now_ms(),
                expires_at: now + self.ttl,
            },
        );
        true
    }

    /// Clear a user from this node's entries and from every other node's
    /// copy. Returns `true` if they were typing anywhere.
    pub fn stop(&self, channel_id: &str, user_id: &str) -> bool {
        let removed = self
            .channels
            .get_mut(channel_id)
            .map(|mut channel| {
                let mut removed = channel.local.remove(user_id).is_some();
                for users in channel.remote.values_mut() {
                    removed |= users.remove(user_id).is_some();
                }
                channel.remote.retain(|_, users| !users.is_empty());
                removed
            })
            .unwrap_or(false);
        self.channels.remove_if(channel_id, |_, c| c.is_empty());
        removed
    }

    /// Drop expired entries.
    pub fn sweep(&self, channel_id: &str) -> Swept {
        let now = Instant::now();
        let swept = self
            .channels
            .get_mut(channel_id)
            .map(|mut channel| {
                let local = retain_live(&mut channel.local, now);
                let mut remote = false;
                for users in channel.remote.values_mut() {
                    remote |= retain_live(users, now);
                }
                channel.remote.retain(|_, users| !users.is_empty());
                Swept { local, remote }
            })
            .unwrap_or_default();
        self.channels.remove_if(channel_id, |_, c| c.is_empty());
        swept
    }

    /// Adopt `origin`'s snapshot of its own typists.
    ///
    /// Remaining lifetime is derived from each entry's `started_at`, so a
    /// copy never outlives the TTL of the start it was announced with.
    pub fn replace(&self, channel_id: &str, origin: &str, entries: Vec<TypingEntry>) {
        let now = Instant::now();
        let wall = now_ms();
        let users: HashMap<String, TypingEntry> = entries
            .into_iter()
            .filter_map(|mut entry| {
                let age = Duration::from_millis(wall.saturating_sub(entry.started_at));
                let remaining = self.ttl.checked_sub(age)?;
                entry.expires_at = now + remaining;
                Some((entry.user_id.clone(), entry))
            })
            .collect();

        let mut channel = self.channels.entry(channel_id.to_string()).or_default();
        if users.is_empty() {
            channel.remote.remove(origin);
        } else {
            channel.remote.insert(origin.to_string(), users);
        }
        drop(channel);
        self.channels.remove_if(channel_id, |_, c| c.is_empty());
    }

    /// Unexpired typists on any node, oldest first. A user typing through
    /// several nodes appears once.
    #[must_use]
    pub fn snapshot(&self, channel_id: &str) -> Vec<TypingEntry> {
        let now = Instant::now();
        let Some(channel) = self.channels.get(channel_id) else {
            return Vec::new();
        };

        let mut merged: HashMap<&str, &TypingEntry> = HashMap::new();
        let all = channel
            .local
            .values()
            .chain(channel.remote.values().flat_map(HashMap::values));
        for entry in all.filter(|entry| !entry.is_expired(now)) {
            merged
                .entry(entry.user_id.as_str())
                .and_modify(|current| {
                    if entry.started_at > current.started_at {
                        *current = entry;
                    }
                })
                .or_insert(entry);
        }
        sorted(merged.into_values().cloned().collect())
    }

    /// This node's own unexpired typists, oldest first.
    #[must_use]
    pub fn local_snapshot(&self, channel_id: &str) -> Vec<TypingEntry> {
        let now = Instant::now();
        let entries = self
            .channels
            .get(channel_id)
            .map(|channel| {
                channel
                    .local
                    .values()
                    .filter(|entry| !entry.is_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        sorted(entries)
    }

    /// Channels with any entries.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.key().clone()).collect()
    }

    /// Channels in which `user_id` is typing on any node.
    #[must_use]
    pub fn channels_for(&self, user_id: &str) -> Vec<String> {
        self.channels
            .iter()
            .filter(|c| c.value().contains(user_id))
            .map(|c| c.key().clone())
            .collect()
    }
}

/// Local fan-out topic for a channel's typing indicators.
#[must_use]
pub fn typing_topic(channel_id: &str) -> String {
    format!("typing:{channel_id}")
}

/// Tracks and distributes typing indicators.
pub struct TypingManager {
    store: TypingStore,
    connections: Arc<ConnectionManager>,
    replicator: Replicator,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TypingManager {
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        ttl: Duration,
        connections: Arc<ConnectionManager>,
        transport: Arc<BrokerTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: TypingStore::new(ttl),
            connections,
            replicator: Replicator::new(node_id, topics::TYPING, transport),
            sweeper: Mutex::new(None),
        })
    }

    /// Begin receiving indicators from other nodes.
    pub async fn start(self: &Arc<Self>) {
        self.replicator.attach(self).await;
    }

    /// Sweep every channel each `interval` and announce expiries.
    pub async fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                for channel_id in manager.store.channels() {
                    manager.sweep_and_publish(&channel_id).await;
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().await.replace(task) {
            previous.abort();
        }
    }

    pub async fn stop(&self) {
        if let Some(task) = self.sweeper.lock().await.take() {
            task.abort();
        }
        self.replicator.detach().await;
    }

    /// Update a user's typing status. Returns `true` if the set of typists
    /// changed. Refreshing an indicator that is already up resets its TTL
    /// without generating traffic. A stop clears the user on every node.
    pub async fn set_status(
        &self,
        channel_id: &str,
        user_id: &str,
        display_name: &str,
        is_typing: bool,
    ) -> bool {
        self.sweep_and_publish(channel_id).await;

        if is_typing {
            let changed = self.store.start(channel_id, user_id, display_name);
            if changed {
                self.publish("start", channel_id, None).await;
            }
            changed
        } else {
            let changed = self.store.stop(channel_id, user_id);
            if changed {
                self.publish("stop", channel_id, Some(user_id)).await;
            }
            changed
        }
    }

    /// Clear a user in one channel.
    pub async fn clear_user(&self, channel_id: &str, user_id: &str) -> bool {
        self.set_status(channel_id, user_id, "", false).await
    }

    /// Clear a user in every channel, as on disconnect.
    pub async fn clear_user_everywhere(&self, user_id: &str) -> usize {
        let channels = self.store.channels_for(user_id);
        let mut cleared = 0;
        for channel_id in channels {
            if self.clear_user(&channel_id, user_id).await {
                cleared += 1;
            }
        }
        cleared
    }

    /// Unexpired typists in a channel, oldest first.
    pub async fn snapshot(&self, channel_id: &str) -> Vec<TypingEntry> {
        self.sweep_and_publish(channel_id).await;
        self.store.snapshot(channel_id)
    }

    async fn sweep_and_publish(&self, channel_id: &str) {
        let swept = self.store.sweep(channel_id);
        if swept.local {
            debug!(channel = %channel_id, "Typing indicators expired");
            self.publish("expire", channel_id, None).await;
        } else if swept.remote {
            let users = self.store.snapshot(channel_id);
            self.fan_out(channel_id, &users).await;
        }
    }

    /// Fan out the merged view and replicate this node's own typists.
    /// `stopped` names a user cleared cluster-wide.
    async fn publish(&self, action: &str, channel_id: &str, stopped: Option<&str>) {
        let users = self.store.snapshot(channel_id);
        self.fan_out(channel_id, &users).await;

        let own = self.store.local_snapshot(channel_id);
        let envelope = Envelope::for_channel(action, channel_id)
            .with("users", &own)
            .and_then(|envelope| match stopped {
                Some(user_id) => envelope.with("user_id", user_id),
                None => Ok(envelope),
            });
        match envelope {
            Ok(envelope) => {
                self.replicator.publish(envelope).await;
            }
            Err(e) => warn!(channel = %channel_id, error = %e, "Typing envelope build failed"),
        }
    }

    async fn fan_out(&self, channel_id: &str, users: &[TypingEntry]) {
        let event = json!({
            "type": "typing",
            "channel_id": channel_id,
            "users": users,
        });
        self.connections
            .broadcast(&typing_topic(channel_id), &event, &[])
            .await;
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
        let users: Vec<TypingEntry> = envelope.optional_field("users")?.unwrap_or_default();

        self.store.replace(channel_id, origin, users);
        if envelope.action == "stop" {
            if let Some(user_id) = envelope.optional_field::<String>("user_id")? {
                self.store.stop(channel_id, &user_id);
            }
        }
        let users = self.store.snapshot(channel_id);
        self.fan_out(channel_id, &users).await;
        Ok(())
    }
}

#[async_trait]
impl ReplicaSink for TypingManager {
    async fn apply_remote(&self, envelope: Envelope) {
        if let Err(e) = self.apply(&envelope).await {
            warn!(action = %envelope.action, error = %e, "Ignoring typing envelope");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingConnection;

    fn manager(ttl: Duration) -> (Arc<TypingManager>, Arc<RecordingConnection>) {
        let connections = Arc::new(ConnectionManager::new());
        let watcher = RecordingConnection::new("w");
        connections.connect(&typing_topic("general"), watcher.clone());
        let manager = TypingManager::new(
            "node-a",
            ttl,
            connections,
            Arc::new(BrokerTransport::local_only()),
        );
        (manager, watcher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_strictly_after_ttl() {
        let (manager, _) = manager(Duration::from_secs(8));
        assert!(manager.set_status("general", "u1", "Alice", true).await);

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(manager.snapshot("general").await.len(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(manager.snapshot("general").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_without_traffic() {
        let (manager, watcher) = manager(Duration::from_secs(8));
        assert!(manager.set_status("general", "u1", "Alice", true).await);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!manager.set_status("general", "u1", "Alice", true).await);
        assert_eq!(watcher.events("typing").len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(manager.snapshot("general").await.len(), 1);
    }

    #[tokio::test]
    async fn test_redundant_stop_is_silent() {
        let (manager, watcher) = manager(DEFAULT_TYPING_TTL);
        assert!(!manager.set_status("general", "u1", "Alice", false).await);
        assert!(watcher.received().is_empty());

        manager.set_status("general", "u1", "Alice", true).await;
        manager.set_status("general", "u2", "Bob", true).await;
        assert!(manager.clear_user("general", "u1").await);

        let last = watcher.events("typing").pop().unwrap();
        assert_eq!(last["users"].as_array().unwrap().len(), 1);
        assert_eq!(last["users"][0]["user_id"], "u2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_announces_expiry() {
        let (manager, watcher) = manager(Duration::from_secs(2));
        manager.spawn_sweeper(Duration::from_secs(1)).await;
        manager.set_status("general", "u1", "Alice", true).await;
        watcher.clear();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let events = watcher.events("typing");
        assert_eq!(events.len(), 1);
        assert!(events[0]["users"].as_array().unwrap().is_empty());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_clear_user_everywhere() {
        let (manager, _) = manager(DEFAULT_TYPING_TTL);
        manager.set_status("a", "u1", "Alice", true).await;
        manager.set_status("b", "u1", "Alice", true).await;
        manager.set_status("b", "u2", "Bob", true).await;

        assert_eq!(manager.clear_user_everywhere("u1").await, 2);
        assert!(manager.snapshot("a").await.is_empty());
        assert_eq!(manager.snapshot("b").await.len(), 1);
    }

    fn remote_entry(user_id: &str, display_name: &str) -> TypingEntry {
        TypingEntry {
            user_id: user_id.into(),
            display_name: display_name.into(),
            started_at: now_ms(),
            expires_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_remote_snapshot_merges_with_local_view() {
        let (manager, watcher) = manager(DEFAULT_TYPING_TTL);
        manager.set_status("general", "u1", "Alice", true).await;

        let envelope = Envelope::for_channel("start", "general")
            .with("users", vec![remote_entry("u2", "Bob")])
            .unwrap()
            .with_origin("node-b");
        manager.apply_remote(envelope).await;

        let users = manager.snapshot("general").await;
        assert_eq!(users.len(), 2);
        let last = watcher.events("typing").pop().unwrap();
        assert_eq!(last["users"].as_array().unwrap().len(), 2);

        // An empty snapshot from node-b only withdraws node-b's typists.
        let envelope = Envelope::for_channel("expire", "general")
            .with("users", Vec::<TypingEntry>::new())
            .unwrap()
            .with_origin("node-b");
        manager.apply_remote(envelope).await;
        let users = manager.snapshot("general").await;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_id, "u1");
    }

    #[tokio::test]
    async fn test_remote_stop_clears_own_entry() {
        let (manager, _) = manager(DEFAULT_TYPING_TTL);
        manager.set_status("general", "u1", "Alice", true).await;

        let envelope = Envelope::for_channel("stop", "general")
            .with("users", Vec::<TypingEntry>::new())
            .unwrap()
            .with("user_id", "u1")
            .unwrap()
            .with_origin("node-b");
        manager.apply_remote(envelope).await;
        assert!(manager.snapshot("general").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_separates_own_and_copied_entries() {
        let store = TypingStore::new(Duration::from_secs(8));
        store.replace("general", "node-b", vec![remote_entry("u2", "Bob")]);
        tokio::time::advance(Duration::from_secs(4)).await;
        store.start("general", "u1", "Alice");

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(
            store.sweep("general"),
            Swept {
                local: false,
                remote: true,
            }
        );
        assert_eq!(store.snapshot("general").len(), 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            store.sweep("general"),
            Swept {
                local: true,
                remote: false,
            }
        );
        assert!(store.channels().is_empty());
    }

    #[test]
    fn test_stale_remote_entries_are_dropped() {
        let store = TypingStore::new(Duration::from_secs(8));
        let mut stale = remote_entry("u1", "Alice");
        stale.started_at = now_ms().saturating_sub(60_000);
        store.replace("general", "node-b", vec![stale]);
        assert!(store.channels().is_empty());
    }
}
