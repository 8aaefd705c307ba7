//! Backend selection facade.
//!
//! [`BrokerTransport`] owns the configured backends, namespaces topics with
//! a prefix and picks a backend per call. Asking for a backend that is not
//! configured degrades: NATS falls back to Redis (then local) with a one-time
//! warning; anything else is [`BrokerError::TransportUnavailable`] so the
//! caller keeps delivering locally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, warn};

use crate::metrics::{self, PublishErrorLabels, TopicLabels};
use crate::subscription::Subscription;
use crate::traits::{Backend, Broker, BrokerError, MessageHandler};

/// Order tried when the requested backend is missing.
const FALLBACK_ORDER: [Backend; 2] = [Backend::Redis, Backend::Local];

/// The broker transport used by every manager.
pub struct BrokerTransport {
    prefix: String,
    default_backend: Option<Backend>,
    brokers: HashMap<Backend, Arc<dyn Broker>>,
    fallback_warned: AtomicBool,
}

impl BrokerTransport {
    /// A transport with no backends: every publish is unavailable and the
    /// managers run local-only.
    #[must_use]
    pub fn local_only() -> Self {
        Self {
            prefix: String::new(),
            default_backend: None,
            brokers: HashMap::new(),
            fallback_warned: AtomicBool::new(false),
        }
    }

    /// Namespace every topic as `<prefix>:<topic>`.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Register a backend. The first one added becomes the default.
    #[must_use]
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        let backend = broker.backend();
        self.default_backend.get_or_insert(backend);
        self.brokers.insert(backend, broker);
        self
    }

    /// Override the default backend.
    #[must_use]
    pub fn with_default(mut self, backend: Backend) -> Self {
        self.default_backend = Some(backend);
        self
    }

    #[must_use]
    pub fn default_backend(&self) -> Option<Backend> {
        self.default_backend
    }

    /// Backends registered, in no particular order.
    #[must_use]
    pub fn backends(&self) -> Vec<Backend> {
        self.brokers.keys().copied().collect()
    }

    /// Fully qualified broker topic.
    #[must_use]
    pub fn topic(&self, topic: &str) -> String {
        if self.prefix.is_empty() {
            topic.to_string()
        } else {
            format!("{}:{}", self.prefix, topic)
        }
    }

    fn resolve(&self, requested: Option<Backend>) -> Result<&Arc<dyn Broker>, BrokerError> {
        let Some(wanted) = requested.or(self.default_backend) else {
            return Err(BrokerError::unavailable(
                Backend::Local,
                "no broker configured",
            ));
        };

        if let Some(broker) = self.brokers.get(&wanted) {
            return Ok(broker);
        }

        if wanted == Backend::Nats {
            if let Some(broker) = FALLBACK_ORDER.iter().find_map(|b| self.brokers.get(b)) {
                if !self.fallback_warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        fallback = %broker.backend(),
                        "NATS backend not configured, falling back"
                    );
                }
                return Ok(broker);
            }
        }

        Err(BrokerError::unavailable(wanted, "backend not configured"))
    }

    /// Start every backend. Failures are logged, never returned: backends
    /// keep reconnecting in the background.
    pub async fn start(&self) {
        for broker in self.brokers.values() {
            match broker.start().await {
                Ok(()) => info!(backend = %broker.backend(), "Broker started"),
                Err(e) => warn!(backend = %broker.backend(), error = %e, "Broker start failed"),
            }
        }
    }

    /// Stop every backend and close their subscriptions.
    pub async fn stop(&self) {
        for broker in self.brokers.values() {
            broker.stop().await;
        }
    }

    /// Publish to `topic` on `backend` (or the default).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TransportUnavailable`] when no backend is
    /// reachable.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        backend: Option<Backend>,
    ) -> Result<(), BrokerError> {
        let broker = self.resolve(backend)?;
        let topic = self.topic(topic);

        match broker.publish(&topic, payload).await {
            Ok(()) => {
                metrics::record_publish(&TopicLabels {
                    topic: &topic,
                    backend: broker.backend(),
                });
                Ok(())
            }
            Err(e) => {
                metrics::record_publish_error(&PublishErrorLabels {
                    topic: &topic,
                    backend: broker.backend(),
                    category: e.category(),
                });
                Err(e)
            }
        }
    }

    /// Subscribe to `topic` on `backend` (or the default).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TransportUnavailable`] when no backend is
    /// reachable.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        backend: Option<Backend>,
    ) -> Result<Subscription, BrokerError> {
        let broker = self.resolve(backend)?;
        broker.subscribe(&self.topic(topic), handler).await
    }

    /// Whether the default backend is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.resolve(None).map(|b| b.is_connected()).unwrap_or(false)
    }

    /// Total recovery cycles across backends.
    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.brokers.values().map(|b| b.restarts()).sum()
    }
}

impl Default for BrokerTransport {
    fn default() -> Self {
        Self::local_only()
    }
}
