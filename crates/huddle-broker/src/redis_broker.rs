//! Redis pub/sub backend.
//!
//! Publishing goes through one multiplexed connection. Every subscription
//! owns a dedicated pub/sub connection and a reader task; when a reader's
//! stream ends (connection lost) it triggers the single-flight recovery,
//! which rebuilds the client, the publisher and every registered reader
//! before the backend reports connected again.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffConfig;
use crate::recovery::Recovery;
use crate::subscription::{ReaderHandle, Subscription, SubscriptionTable};
use crate::traits::{Backend, Broker, BrokerError, MessageHandler};

fn unavailable(e: impl std::fmt::Display) -> BrokerError {
    BrokerError::unavailable(Backend::Redis, e)
}

struct Connected {
    client: redis::Client,
    publisher: MultiplexedConnection,
}

struct Inner {
    url: String,
    state: RwLock<Option<Connected>>,
    recovery: Arc<Recovery>,
    table: Arc<SubscriptionTable>,
}

impl Inner {
    async fn connect(&self) -> Result<(), BrokerError> {
        let client = redis::Client::open(self.url.as_str()).map_err(unavailable)?;
        let mut publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut publisher)
            .await
            .map_err(unavailable)?;

        *self.state.write().await = Some(Connected { client, publisher });
        Ok(())
    }

    async fn client(&self) -> Result<redis::Client, BrokerError> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|c| c.client.clone())
            .ok_or_else(|| unavailable("not connected"))
    }

    async fn spawn_reader(
        self: &Arc<Self>,
        topic: String,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ReaderHandle, BrokerError> {
        let client = self.client().await?;
        let mut pubsub = client.get_async_pubsub().await.map_err(unavailable)?;
        pubsub
            .subscribe(topic.as_str())
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = messages.next() => match received {
                        Some(msg) => {
                            let payload = Bytes::copy_from_slice(msg.get_payload_bytes());
                            handler.handle(&topic, payload).await;
                        }
                        None => {
                            warn!(topic = %topic, "Redis subscription stream ended");
                            if let Some(inner) = inner.upgrade() {
                                inner.connection_lost();
                            }
                            break;
                        }
                    },
                }
            }
            // Dropping the stream closes the pub/sub connection.
        });

        Ok(ReaderHandle::new(cancel, task))
    }

    fn connection_lost(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        if self.recovery.trigger(move || {
            let inner = Arc::clone(&inner);
            async move { inner.reconnect().await }
        }) {
            info!(url = %self.url, "Redis recovery started");
        }
    }

    async fn reconnect(self: &Arc<Self>) -> Result<(), BrokerError> {
        self.state.write().await.take();
        self.connect().await?;

        for (id, topic, handler) in self.table.registered().await {
            let reader = self.spawn_reader(topic.clone(), handler).await?;
            self.table.replace_reader(id, reader).await;
            debug!(topic = %topic, "Redis subscription restored");
        }
        Ok(())
    }
}

/// Redis pub/sub broker.
pub struct RedisBroker {
    inner: Arc<Inner>,
}

impl RedisBroker {
    /// Create a broker for `url` (`redis://host:port/db`). Nothing connects
    /// until [`Broker::start`].
    #[must_use]
    pub fn new(url: impl Into<String>, backoff: BackoffConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                state: RwLock::new(None),
                recovery: Recovery::new(Backend::Redis, backoff),
                table: SubscriptionTable::new(Backend::Redis),
            }),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn backend(&self) -> Backend {
        Backend::Redis
    }

    async fn start(&self) -> Result<(), BrokerError> {
        match self.inner.connect().await {
            Ok(()) => {
                self.inner.recovery.mark_connected();
                info!(url = %self.inner.url, "Connected to Redis");
                Ok(())
            }
            Err(e) => {
                warn!(url = %self.inner.url, error = %e, "Redis unavailable at start, retrying in background");
                self.inner.connection_lost();
                Err(e)
            }
        }
    }

    async fn stop(&self) {
        self.inner.recovery.stop();
        self.inner.table.release_all().await;
        self.inner.state.write().await.take();
        info!(url = %self.inner.url, "Redis broker stopped");
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        if self.inner.recovery.is_stopped() {
            return Err(BrokerError::Stopped);
        }
        if !self.inner.recovery.is_connected() {
            self.inner.connection_lost();
            return Err(unavailable("reconnecting"));
        }

        let mut publisher = match self.inner.state.read().await.as_ref() {
            Some(connected) => connected.publisher.clone(),
            None => return Err(unavailable("not connected")),
        };

        let result: redis::RedisResult<i64> = publisher.publish(topic, payload.as_ref()).await;
        match result {
            Ok(receivers) => {
                debug!(topic = %topic, receivers, "Published to Redis");
                Ok(())
            }
            Err(e) if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() => {
                self.inner.connection_lost();
                Err(unavailable(e))
            }
            Err(e) => Err(BrokerError::Publish(e.to_string())),
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
        if !self.inner.recovery.is_connected() {
            return Err(unavailable("reconnecting"));
        }

        let reader = match self
            .inner
            .spawn_reader(topic.to_string(), Arc::clone(&handler))
            .await
        {
            Ok(reader) => reader,
            Err(e) => {
                if e.is_unavailable() {
                    self.inner.connection_lost();
                }
                return Err(e);
            }
        };
        Ok(self.inner.table.insert(topic, handler, reader).await)
    }

    fn is_connected(&self) -> bool {
        self.inner.recovery.is_connected()
    }

    fn restarts(&self) -> u64 {
        self.inner.recovery.restarts()
    }
}
