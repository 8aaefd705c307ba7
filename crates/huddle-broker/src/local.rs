//! In-process broker.
//!
//! A [`LocalBus`] is a tokio broadcast channel shared by every
//! [`LocalBroker`] attached to it, so several logical nodes in one process
//! (or one single-node deployment) see each other's publishes. The bus can
//! be severed and restored to exercise the same recovery path the network
//! backends take.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::BackoffConfig;
use crate::recovery::Recovery;
use crate::subscription::{ReaderHandle, Subscription, SubscriptionTable};
use crate::traits::{Backend, Broker, BrokerError, MessageHandler};

/// Default bus capacity.
const DEFAULT_BUS_CAPACITY: usize = 4096;

/// Shared in-process message bus.
#[derive(Debug)]
pub struct LocalBus {
    sender: broadcast::Sender<(String, Bytes)>,
    up: watch::Sender<bool>,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity);
        let (up, _) = watch::channel(true);
        Arc::new(Self { sender, up })
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        *self.up.borrow()
    }

    /// Simulate a broker outage: readers die and publishes fail.
    pub fn sever(&self) {
        self.up.send_replace(false);
    }

    /// End a simulated outage. Brokers reconnect on their next recovery
    /// attempt.
    pub fn restore(&self) {
        self.up.send_replace(true);
    }

    fn send(&self, topic: &str, payload: Bytes) -> Result<usize, BrokerError> {
        if !self.is_up() {
            return Err(BrokerError::unavailable(Backend::Local, "bus severed"));
        }
        // No receivers is not an error: nobody is subscribed yet.
        Ok(self.sender.send((topic.to_string(), payload)).unwrap_or(0))
    }
}

struct Inner {
    bus: Arc<LocalBus>,
    recovery: Arc<Recovery>,
    table: Arc<SubscriptionTable>,
}

impl Inner {
    fn spawn_reader(
        self: &Arc<Self>,
        topic: String,
        handler: Arc<dyn MessageHandler>,
    ) -> ReaderHandle {
        let mut messages = self.bus.sender.subscribe();
        let mut up = self.bus.up.subscribe();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = up.changed() => {
                        if changed.is_err() || !*up.borrow() {
                            if let Some(inner) = inner.upgrade() {
                                inner.connection_lost("bus severed");
                            }
                            break;
                        }
                    }
                    received = messages.recv() => match received {
                        Ok((t, payload)) if t == topic => handler.handle(&topic, payload).await,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "Local bus reader lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            if let Some(inner) = inner.upgrade() {
                                inner.connection_lost("bus closed");
                            }
                            break;
                        }
                    },
                }
            }
        });

        ReaderHandle::new(cancel, task)
    }

    fn connection_lost(self: &Arc<Self>, reason: &str) {
        debug!(reason, "Local bus connection lost");
        let inner = Arc::clone(self);
        self.recovery.trigger(move || {
            let inner = Arc::clone(&inner);
            async move { inner.reconnect().await }
        });
    }

    async fn reconnect(self: &Arc<Self>) -> Result<(), BrokerError> {
        if !self.bus.is_up() {
            return Err(BrokerError::unavailable(Backend::Local, "bus severed"));
        }
        for (id, topic, handler) in self.table.registered().await {
            let reader = self.spawn_reader(topic, handler);
            self.table.replace_reader(id, reader).await;
        }
        Ok(())
    }
}

/// Broker backed by a [`LocalBus`].
pub struct LocalBroker {
    inner: Arc<Inner>,
}

impl LocalBroker {
    #[must_use]
    pub fn new(bus: Arc<LocalBus>) -> Self {
        Self::with_backoff(bus, BackoffConfig::default())
    }

    #[must_use]
    pub fn with_backoff(bus: Arc<LocalBus>, backoff: BackoffConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                recovery: Recovery::new(Backend::Local, backoff),
                table: SubscriptionTable::new(Backend::Local),
            }),
        }
    }

    /// Number of registered subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.inner.table.len().await
    }
}

#[async_trait]
impl Broker for LocalBroker {
    fn backend(&self) -> Backend {
        Backend::Local
    }

    async fn start(&self) -> Result<(), BrokerError> {
        if self.inner.bus.is_up() {
            self.inner.recovery.mark_connected();
            Ok(())
        } else {
            self.inner.connection_lost("bus down at start");
            Err(BrokerError::unavailable(Backend::Local, "bus severed"))
        }
    }

    async fn stop(&self) {
        self.inner.recovery.stop();
        self.inner.table.release_all().await;
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        if self.inner.recovery.is_stopped() {
            return Err(BrokerError::Stopped);
        }
        if !self.inner.recovery.is_connected() {
            self.inner.connection_lost("publish while disconnected");
            return Err(BrokerError::unavailable(Backend::Local, "reconnecting"));
        }
        match self.inner.bus.send(topic, payload) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.inner.connection_lost("publish failed");
                Err(e)
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BrokerError> {
        if self.inner.recovery.is_stopped() {
            return Err(BrokerError::Stopped);
        }
        if !self.inner.recovery.is_connected() || !self.inner.bus.is_up() {
            return Err(BrokerError::unavailable(Backend::Local, "reconnecting"));
        }
        let reader = self
            .inner
            .spawn_reader(topic.to_string(), Arc::clone(&handler));
        Ok(self.inner.table.insert(topic, handler, reader).await)
    }

    fn is_connected(&self) -> bool {
        self.inner.recovery.is_connected()
    }

    fn restarts(&self) -> u64 {
        self.inner.recovery.restarts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<(String, Bytes)>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle(&self, topic: &str, payload: Bytes) {
            let _ = self.0.send((topic.to_string(), payload));
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_on_topic_only() {
        let bus = LocalBus::new();
        let broker = LocalBroker::new(Arc::clone(&bus));
        broker.start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = broker.subscribe("presence", Arc::new(Forward(tx))).await.unwrap();

        broker.publish("typing", Bytes::from_static(b"skip")).await.unwrap();
        broker.publish("presence", Bytes::from_static(b"hello")).await.unwrap();

        let (topic, payload) = rx.recv().await.unwrap();
        assert_eq!(topic, "presence");
        assert_eq!(&payload[..], b"hello");

        sub.close().await;
        sub.close().await;
        assert_eq!(broker.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_severed_bus_fails_fast() {
        let bus = LocalBus::new();
        let broker = LocalBroker::new(Arc::clone(&bus));
        broker.start().await.unwrap();

        bus.sever();
        let err = broker
            .publish("presence", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(!broker.is_connected());
    }
}
