//! Cross-node replication over the broker transport.
//!
//! Every manager owns a [`Replicator`] bound to one broker topic. Outbound
//! envelopes are stamped with the node id; inbound envelopes carrying this
//! node's id are dropped before they reach the manager. Publish failures
//! never reach the caller: local delivery has already happened and the
//! outage is logged once per failure streak.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use huddle_broker::{
    BackoffConfig, BrokerError, BrokerTransport, ExponentialBackoff, MessageHandler, Subscription,
};
use huddle_protocol::{codec, Envelope};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::{self, ReplicationLabels};

/// Receiver side of replication, implemented by each manager.
#[async_trait]
pub trait ReplicaSink: Send + Sync + 'static {
    /// Apply an envelope published by another node.
    async fn apply_remote(&self, envelope: Envelope);
}

/// Broker handler that filters self-echo and forwards to a sink.
///
/// Holds the sink weakly so a registered subscription never keeps a dropped
/// manager alive.
struct ReplicaHandler<T> {
    node_id: String,
    topic: &'static str,
    sink: Weak<T>,
}

#[async_trait]
impl<T: ReplicaSink> MessageHandler for ReplicaHandler<T> {
    async fn handle(&self, _topic: &str, payload: Bytes) {
        let labels = ReplicationLabels { topic: self.topic };
        let envelope = match codec::decode(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics::record_decode_error(&labels);
                warn!(topic = self.topic, error = %e, "Dropping undecodable envelope");
                return;
            }
        };

        if envelope.is_from(&self.node_id) {
            metrics::record_self_echo(&labels);
            return;
        }

        let Some(sink) = self.sink.upgrade() else {
            return;
        };
        metrics::record_received(&labels);
        sink.apply_remote(envelope).await;
    }
}

/// Publisher and subscription owner for one replication topic.
pub struct Replicator {
    node_id: String,
    topic: &'static str,
    transport: Arc<BrokerTransport>,
    failing: AtomicBool,
    subscription: Arc<Mutex<Option<Subscription>>>,
    attach_task: Mutex<Option<JoinHandle<()>>>,
}

impl Replicator {
    #[must_use]
    pub fn new(node_id: impl Into<String>, topic: &'static str, transport: Arc<BrokerTransport>) -> Self {
        Self {
            node_id: node_id.into(),
            topic,
            transport,
            failing: AtomicBool::new(false),
            subscription: Arc::new(Mutex::new(None)),
            attach_task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn topic(&self) -> &'static str {
        self.topic
    }

    /// Stamp `envelope` with this node's id and publish it.
    ///
    /// Returns whether the broker accepted it.
    pub async fn publish(&self, envelope: Envelope) -> bool {
        let envelope = envelope.with_origin(self.node_id.as_str());
        let payload = match codec::encode(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = self.topic, action = %envelope.action, error = %e, "Envelope encode failed");
                return false;
            }
        };

        match self.transport.publish(self.topic, payload, None).await {
            Ok(()) => {
                if self.failing.swap(false, Ordering::Relaxed) {
                    info!(topic = self.topic, "Replication restored");
                }
                true
            }
            Err(e) => {
                if self.failing.swap(true, Ordering::Relaxed) {
                    debug!(topic = self.topic, error = %e, "Replication still unavailable");
                } else {
                    warn!(
                        topic = self.topic,
                        category = e.category(),
                        error = %e,
                        "Replication unavailable, delivering locally only"
                    );
                }
                false
            }
        }
    }

    /// Subscribe `sink` to remote envelopes.
    ///
    /// Runs in the background and retries with backoff until the broker
    /// accepts the subscription, so a node started during an outage still
    /// joins the cluster once the broker comes back. A transport with no
    /// backend is not retried.
    pub async fn attach<T: ReplicaSink>(&self, sink: &Arc<T>) {
        let handler: Arc<dyn MessageHandler> = Arc::new(ReplicaHandler {
            node_id: self.node_id.clone(),
            topic: self.topic,
            sink: Arc::downgrade(sink),
        });
        if self.transport.default_backend().is_none() {
            debug!(topic = self.topic, "No broker configured, replication disabled");
            return;
        }

        let transport = Arc::clone(&self.transport);
        let slot = Arc::clone(&self.subscription);
        let topic = self.topic;

        let task = tokio::spawn(async move {
            let mut backoff = ExponentialBackoff::new(BackoffConfig::default());
            loop {
                match transport.subscribe(topic, Arc::clone(&handler), None).await {
                    Ok(subscription) => {
                        debug!(topic, "Replication subscribed");
                        *slot.lock().await = Some(subscription);
                        return;
                    }
                    Err(BrokerError::Stopped) => return,
                    Err(e) if e.is_unavailable() => {
                        let delay = backoff.next_delay();
                        debug!(topic, error = %e, delay_ms = delay.as_millis() as u64, "Replication subscribe deferred");
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        warn!(topic, error = %e, "Replication subscribe failed");
                        return;
                    }
                }
            }
        });

        if let Some(previous) = self.attach_task.lock().await.replace(task) {
            previous.abort();
        }
    }

    /// Whether the remote subscription is established.
    pub async fn is_attached(&self) -> bool {
        self.subscription.lock().await.is_some()
    }

    /// Stop receiving remote envelopes.
    pub async fn detach(&self) {
        if let Some(task) = self.attach_task.lock().await.take() {
            task.abort();
        }
        if let Some(subscription) = self.subscription.lock().await.take() {
            subscription.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_broker::{LocalBroker, LocalBus};
    use huddle_protocol::topics;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<Envelope>);

    #[async_trait]
    impl ReplicaSink for Forward {
        async fn apply_remote(&self, envelope: Envelope) {
            let _ = self.0.send(envelope);
        }
    }

    async fn transport(bus: &Arc<LocalBus>) -> Arc<BrokerTransport> {
        let transport = BrokerTransport::local_only()
            .with_broker(Arc::new(LocalBroker::new(Arc::clone(bus))));
        transport.start().await;
        Arc::new(transport)
    }

    #[tokio::test]
    async fn test_self_echo_is_dropped() {
        let bus = LocalBus::new();
        let a = Replicator::new("node-a", topics::PRESENCE, transport(&bus).await);
        let b = Replicator::new("node-b", topics::PRESENCE, transport(&bus).await);

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let sink_a = Arc::new(Forward(tx_a));
        let sink_b = Arc::new(Forward(tx_b));
        a.attach(&sink_a).await;
        b.attach(&sink_b).await;
        while !a.is_attached().await || !b.is_attached().await {
            tokio::task::yield_now().await;
        }

        assert!(a.publish(Envelope::for_channel("join", "general")).await);

        let received = rx_b.recv().await.unwrap();
        assert_eq!(received.origin.as_deref(), Some("node-a"));
        assert_eq!(received.action, "join");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_broker_is_swallowed() {
        let replicator = Replicator::new(
            "node-a",
            topics::TYPING,
            Arc::new(BrokerTransport::local_only()),
        );
        assert!(!replicator.publish(Envelope::for_channel("start", "c1")).await);
        assert!(!replicator.publish(Envelope::for_channel("stop", "c1")).await);
    }
}
