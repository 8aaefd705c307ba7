//! Local fan-out registry.
//!
//! Connections are grouped by topic (`presence:<channel>`,
//! `typing:<channel>`, `voice:<room>`). Broadcasting snapshots the target
//! set under the map lock, releases it, then sends; a failed send is counted
//! and skipped so one dead socket never blocks delivery to the others.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

use crate::metrics::{self, KindLabels};

/// Atomic counter keeping generated ids unique within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque per-socket identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection id.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}", timestamp.wrapping_add(counter)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Failure to deliver a payload to one connection.
#[derive(Debug, Error)]
pub enum SendError {
    /// The socket is gone.
    #[error("Connection closed")]
    Closed,

    /// The payload could not be serialized.
    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Transport-specific failure.
    #[error("Send failed: {0}")]
    Other(String),
}

/// The send half of an authenticated client socket, owned by the caller's
/// WebSocket layer.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Stable id for this socket.
    fn id(&self) -> &ConnectionId;

    /// Deliver one JSON payload.
    async fn send(&self, payload: &Value) -> Result<(), SendError>;
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub topic_count: usize,
    pub connection_count: usize,
}

/// Metric label for a topic: the part before the first `:`.
fn topic_kind(topic: &str) -> &str {
    topic.split(':').next().unwrap_or(topic)
}

/// Per-topic set of live local connections.
#[derive(Default)]
pub struct ConnectionManager {
    topics: DashMap<String, HashMap<ConnectionId, Arc<dyn Connection>>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` under `topic`. Returns `false` if it was already
    /// registered (the handle is replaced).
    pub fn connect(&self, topic: &str, conn: Arc<dyn Connection>) -> bool {
        let id = conn.id().clone();
        let is_new = self
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(id.clone(), conn)
            .is_none();

        if is_new {
            metrics::connection_opened(&KindLabels::new(topic_kind(topic)));
            debug!(topic = %topic, connection = %id, "Connection registered");
        }
        is_new
    }

    /// Remove `id` from `topic`. Empty topics are dropped.
    pub fn disconnect(&self, topic: &str, id: &ConnectionId) -> bool {
        let removed = match self.topics.get_mut(topic) {
            Some(mut conns) => conns.remove(id).is_some(),
            None => false,
        };
        self.topics.remove_if(topic, |_, conns| conns.is_empty());

        if removed {
            metrics::connection_closed(&KindLabels::new(topic_kind(topic)));
            debug!(topic = %topic, connection = %id, "Connection removed");
        }
        removed
    }

    /// Remove `id` from every topic. Returns the topics it was in.
    pub fn disconnect_all(&self, id: &ConnectionId) -> Vec<String> {
        let topics: Vec<String> = self
            .topics
            .iter()
            .filter(|entry| entry.value().contains_key(id))
            .map(|entry| entry.key().clone())
            .collect();

        topics
            .into_iter()
            .filter(|topic| self.disconnect(topic, id))
            .collect()
    }

    #[must_use]
    pub fn is_connected(&self, topic: &str, id: &ConnectionId) -> bool {
        self.topics
            .get(topic)
            .map(|conns| conns.contains_key(id))
            .unwrap_or(false)
    }

    #[must_use]
    pub fn connection_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|conns| conns.len()).unwrap_or(0)
    }

    /// Snapshot of the connections under `topic`.
    #[must_use]
    pub fn connections(&self, topic: &str) -> Vec<Arc<dyn Connection>> {
        self.topics
            .get(topic)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            topic_count: self.topics.len(),
            connection_count: self.topics.iter().map(|e| e.value().len()).sum(),
        }
    }

    /// Deliver `payload` to every connection under `topic` except those in
    /// `exclude`.
    pub async fn broadcast(
        &self,
        topic: &str,
        payload: &Value,
        exclude: &[ConnectionId],
    ) -> DeliveryReport {
        let targets: Vec<Arc<dyn Connection>> = self
            .connections(topic)
            .into_iter()
            .filter(|conn| !exclude.contains(conn.id()))
            .collect();

        let mut report = DeliveryReport::default();
        for conn in targets {
            if Self::deliver(topic, conn.as_ref(), payload).await {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }

        trace!(
            topic = %topic,
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast"
        );
        report
    }

    /// Point-to-point delivery with the same accounting as
    /// [`broadcast`](Self::broadcast).
    pub async fn send_to(&self, topic: &str, conn: &dyn Connection, payload: &Value) -> bool {
        Self::deliver(topic, conn, payload).await
    }

    async fn deliver(topic: &str, conn: &dyn Connection, payload: &Value) -> bool {
        let labels = KindLabels::new(topic_kind(topic));
        match conn.send(payload).await {
            Ok(()) => {
                metrics::record_delivery(&labels);
                true
            }
            Err(e) => {
                metrics::record_delivery_failure(&labels);
                debug!(topic = %topic, connection = %conn.id(), error = %e, "Delivery failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingConnection;
    use serde_json::json;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connect_disconnect() {
        let manager = ConnectionManager::new();
        let conn = RecordingConnection::new("c1");

        assert!(manager.connect("presence:general", conn.clone()));
        assert!(!manager.connect("presence:general", conn.clone()));
        assert_eq!(manager.connection_count("presence:general"), 1);

        assert!(manager.disconnect("presence:general", conn.id()));
        assert!(!manager.disconnect("presence:general", conn.id()));
        assert_eq!(manager.stats().topic_count, 0);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_and_survives_failures() {
        let manager = ConnectionManager::new();
        let a = RecordingConnection::new("a");
        let b = RecordingConnection::new("b");
        let broken = RecordingConnection::failing("broken");
        let c = RecordingConnection::new("c");

        for conn in [&a, &b, &broken, &c] {
            manager.connect("voice:r1", conn.clone());
        }

        let report = manager
            .broadcast("voice:r1", &json!({"n": 1}), &[b.id().clone()])
            .await;

        assert_eq!(report, DeliveryReport { delivered: 2, failed: 1 });
        assert_eq!(a.received(), vec![json!({"n": 1})]);
        assert!(b.received().is_empty());
        assert_eq!(c.received(), vec![json!({"n": 1})]);
    }

    #[test]
    fn test_disconnect_all() {
        let manager = ConnectionManager::new();
        let conn = RecordingConnection::new("c1");
        manager.connect("presence:a", conn.clone());
        manager.connect("typing:a", conn.clone());

        let mut topics = manager.disconnect_all(conn.id());
        topics.sort();
        assert_eq!(topics, vec!["presence:a", "typing:a"]);
        assert_eq!(manager.stats().connection_count, 0);
    }
}
