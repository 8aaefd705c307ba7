//! Process assembly: one transport and one of each manager, shared by every
//! socket.

use std::sync::Arc;

use huddle_broker::{BrokerTransport, LocalBroker, LocalBus, RedisBroker};
use huddle_core::voice::WebhookNotifier;
use huddle_core::{ConnectionManager, PresenceManager, TypingManager, VoiceSignalManager};
use tracing::info;

use crate::config::{BackendChoice, BrokerConfig, Config};

/// Shared server state.
pub struct AppState {
    pub config: Config,
    pub transport: Arc<BrokerTransport>,
    pub connections: Arc<ConnectionManager>,
    pub presence: Arc<PresenceManager>,
    pub typing: Arc<TypingManager>,
    pub voice: Arc<VoiceSignalManager>,
}

impl AppState {
    /// Build the transport and managers and start replication.
    pub async fn start(config: Config) -> Self {
        let node_id = config.server.node_id.clone();
        info!(node = %node_id, backend = ?config.broker.backend, "Assembling node");

        let transport = Arc::new(build_transport(&config.broker));
        transport.start().await;

        let connections = Arc::new(ConnectionManager::new());
        let presence = PresenceManager::new(&node_id, Arc::clone(&connections), Arc::clone(&transport));
        let typing = TypingManager::new(
            &node_id,
            config.typing.ttl(),
            Arc::clone(&connections),
            Arc::clone(&transport),
        );
        let voice = VoiceSignalManager::new(
            &node_id,
            config.voice.policy(),
            Arc::clone(&connections),
            Arc::clone(&transport),
            WebhookNotifier::new(config.voice.webhooks()),
        );

        presence.start().await;
        typing.start().await;
        typing.spawn_sweeper(config.typing.sweep_interval()).await;
        voice.start().await;

        Self {
            config,
            transport,
            connections,
            presence,
            typing,
            voice,
        }
    }

    /// Stop replication, drain webhooks and close broker connections.
    pub async fn shutdown(&self) {
        self.typing.stop().await;
        self.presence.stop().await;
        self.voice.stop().await;
        self.transport.stop().await;
        info!("Node stopped");
    }
}

fn build_transport(config: &BrokerConfig) -> BrokerTransport {
    let transport = BrokerTransport::local_only().with_prefix(&config.topic_prefix);
    match config.backend {
        BackendChoice::None => transport,
        BackendChoice::Local => transport.with_broker(Arc::new(LocalBroker::with_backoff(
            LocalBus::new(),
            config.backoff(),
        ))),
        BackendChoice::Redis => {
            transport.with_broker(Arc::new(RedisBroker::new(&config.redis_url, config.backoff())))
        }
        BackendChoice::Nats => with_nats(transport, config),
    }
}

#[cfg(feature = "nats")]
fn with_nats(transport: BrokerTransport, config: &BrokerConfig) -> BrokerTransport {
    transport.with_broker(Arc::new(huddle_broker::NatsBroker::new(&config.nats_url)))
}

/// Without NATS support compiled in, NATS stays the requested default and
/// the transport falls back to Redis.
#[cfg(not(feature = "nats"))]
fn with_nats(transport: BrokerTransport, config: &BrokerConfig) -> BrokerTransport {
    transport
        .with_broker(Arc::new(RedisBroker::new(&config.redis_url, config.backoff())))
        .with_default(huddle_broker::Backend::Nats)
}
