//! NATS backend.
//!
//! The NATS client reconnects and re-subscribes on its own, so this backend
//! only tracks subscriptions for orderly shutdown.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::subscription::{ReaderHandle, Subscription, SubscriptionTable};
use crate::traits::{Backend, Broker, BrokerError, MessageHandler};

fn unavailable(e: impl std::fmt::Display) -> BrokerError {
    BrokerError::unavailable(Backend::Nats, e)
}

/// NATS core pub/sub broker.
pub struct NatsBroker {
    url: String,
    client: RwLock<Option<async_nats::Client>>,
    table: Arc<SubscriptionTable>,
}

impl NatsBroker {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: RwLock::new(None),
            table: SubscriptionTable::new(Backend::Nats),
        }
    }

    async fn client(&self) -> Result<async_nats::Client, BrokerError> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| unavailable("not connected"))
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn backend(&self) -> Backend {
        Backend::Nats
    }

    async fn start(&self) -> Result<(), BrokerError> {
        let client = async_nats::connect(self.url.as_str()).await.map_err(|e| {
            warn!(url = %self.url, error = %e, "NATS unavailable at start");
            unavailable(e)
        })?;
        *self.client.write().await = Some(client);
        info!(url = %self.url, "Connected to NATS");
        Ok(())
    }

    async fn stop(&self) {
        self.table.release_all().await;
        if let Some(client) = self.client.write().await.take() {
            let _ = client.flush().await;
        }
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        let client = self.client().await?;
        if client.connection_state() != async_nats::connection::State::Connected {
            return Err(unavailable("reconnecting"));
        }
        client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BrokerError> {
        let client = self.client().await?;
        let mut subscriber = client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let topic_name = topic.to_string();
        let reader_handler = Arc::clone(&handler);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = subscriber.unsubscribe().await;
                        break;
                    }
                    received = subscriber.next() => match received {
                        Some(msg) => reader_handler.handle(&topic_name, msg.payload).await,
                        None => break,
                    },
                }
            }
        });

        Ok(self
            .table
            .insert(topic, handler, ReaderHandle::new(cancel, task))
            .await)
    }

    fn is_connected(&self) -> bool {
        self.client
            .try_read()
            .ok()
            .and_then(|c| c.as_ref().map(|c| c.connection_state()))
            == Some(async_nats::connection::State::Connected)
    }
}
