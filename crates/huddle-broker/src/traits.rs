//! Broker abstraction traits for huddle.
//!
//! These traits define the interface every pub/sub backend provides, so the
//! managers in `huddle-core` stay backend-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::subscription::Subscription;

/// A pub/sub backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Redis,
    Nats,
    /// In-process bus, single node or tests.
    Local,
}

impl Backend {
    /// Label value used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Redis => "redis",
            Backend::Nats => "nats",
            Backend::Local => "local",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(Backend::Redis),
            "nats" => Ok(Backend::Nats),
            "local" | "memory" => Ok(Backend::Local),
            other => Err(BrokerError::UnknownBackend(other.to_string())),
        }
    }
}

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The backend is not connected or not configured. Callers fall back to
    /// local-only delivery.
    #[error("{backend} transport unavailable: {reason}")]
    TransportUnavailable {
        /// Backend that was asked.
        backend: Backend,
        /// Why it is unavailable.
        reason: String,
    },

    /// The backend accepted the connection but rejected the publish.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// The backend rejected the subscription.
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Backend name not recognised.
    #[error("Unknown broker backend: {0}")]
    UnknownBackend(String),

    /// The transport was stopped.
    #[error("Broker stopped")]
    Stopped,
}

impl BrokerError {
    /// Shorthand for [`BrokerError::TransportUnavailable`].
    pub fn unavailable(backend: Backend, reason: impl fmt::Display) -> Self {
        BrokerError::TransportUnavailable {
            backend,
            reason: reason.to_string(),
        }
    }

    /// Metric label for this error.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            BrokerError::TransportUnavailable { .. } => "unavailable",
            BrokerError::Publish(_) => "publish",
            BrokerError::Subscribe(_) => "subscribe",
            BrokerError::UnknownBackend(_) => "config",
            BrokerError::Stopped => "stopped",
        }
    }

    /// Whether the error means the broker is down rather than misused.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            BrokerError::TransportUnavailable { .. } | BrokerError::Stopped
        )
    }
}

/// Receives messages for a subscribed topic.
///
/// Handlers run on the subscription's reader task; a slow handler delays
/// later messages on the same topic only.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message.
    async fn handle(&self, topic: &str, payload: Bytes);
}

/// A pub/sub backend.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Which backend this is.
    fn backend(&self) -> Backend;

    /// Connect. On failure the backend keeps retrying in the background.
    async fn start(&self) -> Result<(), BrokerError>;

    /// Close every subscription and disconnect.
    async fn stop(&self);

    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribe to a topic. The subscription survives reconnects until it
    /// is closed.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BrokerError>;

    /// Whether the backend currently accepts publishes.
    fn is_connected(&self) -> bool;

    /// Completed recovery cycles since start.
    fn restarts(&self) -> u64 {
        0
    }
}
