//! Two nodes sharing one in-process bus.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use huddle_broker::{BackoffConfig, BrokerTransport, LocalBroker, LocalBus};
use huddle_core::presence::presence_topic;
use huddle_core::typing::typing_topic;
use huddle_core::voice::{Actor, ActorRole, Role, SignalPayload, WebhookNotifier};
use huddle_core::{
    Connection, ConnectionId, ConnectionManager, PresenceEntry, PresenceManager, SendError,
    TypingManager, VoiceConfig, VoiceSignalManager,
};
use serde_json::{json, Value};

struct Socket {
    id: ConnectionId,
    received: Mutex<Vec<Value>>,
}

impl Socket {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(id),
            received: Mutex::new(Vec::new()),
        })
    }

    fn events(&self, kind: &str) -> Vec<Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|v| v["type"] == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Connection for Socket {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send(&self, payload: &Value) -> Result<(), SendError> {
        self.received.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

struct Node {
    transport: Arc<BrokerTransport>,
    connections: Arc<ConnectionManager>,
    presence: Arc<PresenceManager>,
    typing: Arc<TypingManager>,
    voice: Arc<VoiceSignalManager>,
}

impl Node {
    async fn start(node_id: &str, bus: &Arc<LocalBus>, voice: VoiceConfig) -> Self {
        Self::start_with(node_id, bus, voice, Duration::from_secs(8)).await
    }

    async fn start_with(
        node_id: &str,
        bus: &Arc<LocalBus>,
        voice: VoiceConfig,
        typing_ttl: Duration,
    ) -> Self {
        let backoff = BackoffConfig {
            base: Duration::from_millis(20),
            cap: Duration::from_millis(200),
        };
        let transport = BrokerTransport::local_only()
            .with_prefix("huddle")
            .with_broker(Arc::new(LocalBroker::with_backoff(Arc::clone(bus), backoff)));
        transport.start().await;
        let transport = Arc::new(transport);
        let connections = Arc::new(ConnectionManager::new());

        let node = Self {
            presence: PresenceManager::new(
                node_id,
                Arc::clone(&connections),
                Arc::clone(&transport),
            ),
            typing: TypingManager::new(
                node_id,
                typing_ttl,
                Arc::clone(&connections),
                Arc::clone(&transport),
            ),
            voice: VoiceSignalManager::new(
                node_id,
                voice,
                Arc::clone(&connections),
                Arc::clone(&transport),
                WebhookNotifier::disabled(),
            ),
            transport,
            connections,
        };
        node.presence.start().await;
        node.typing.start().await;
        node.voice.start().await;
        node
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_presence_replicates_without_echo() {
    let bus = LocalBus::new();
    let a = Node::start("node-a", &bus, VoiceConfig::default()).await;
    let b = Node::start("node-b", &bus, VoiceConfig::default()).await;
    settle().await;

    let alice = Socket::new("alice");
    let bob = Socket::new("bob");
    a.presence
        .join("general", alice.clone(), PresenceEntry::new("u1", "Alice"))
        .await;
    b.presence
        .join("general", bob.clone(), PresenceEntry::new("u2", "Bob"))
        .await;

    eventually(|| a.presence.snapshot("general").len() == 2).await;
    eventually(|| b.presence.snapshot("general").len() == 2).await;

    // Alice hears Bob's join once; her own join never comes back to her.
    settle().await;
    let heard = alice.events("presence");
    assert_eq!(heard.len(), 1);
    assert_eq!(heard[0]["user"]["user_id"], "u2");

    b.presence.leave_all(bob.id()).await;
    eventually(|| a.presence.snapshot("general").len() == 1).await;
    assert_eq!(alice.events("presence").last().unwrap()["action"], "leave");
}

#[tokio::test]
async fn test_typing_snapshot_crosses_nodes() {
    let bus = LocalBus::new();
    let a = Node::start("node-a", &bus, VoiceConfig::default()).await;
    let b = Node::start("node-b", &bus, VoiceConfig::default()).await;
    settle().await;

    assert!(a.typing.set_status("general", "u1", "Alice", true).await);
    let mut seen = Vec::new();
    for _ in 0..200 {
        seen = b.typing.snapshot("general").await;
        if !seen.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].user_id, "u1");

    assert!(a.typing.clear_user("general", "u1").await);
    for _ in 0..200 {
        if b.typing.snapshot("general").await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("remote typing indicator never cleared");
}

#[tokio::test]
async fn test_voice_cap_spans_nodes() {
    let bus = LocalBus::new();
    let config = VoiceConfig {
        max_speakers: Some(1),
        default_role: Role::Listener,
        auto_promote_first_speaker: true,
    };
    let a = Node::start("node-a", &bus, config.clone()).await;
    let b = Node::start("node-b", &bus, config).await;
    settle().await;

    let alice = Socket::new("alice");
    let bob = Socket::new("bob");
    let first = a.voice.register("stage", alice.clone(), "u1", "Alice").await;
    assert_eq!(first.participant.role, Role::Speaker);

    for _ in 0..200 {
        if b.voice.participant("stage", "u1").await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Node B already sees a speaker, so Bob is not auto-promoted and
    // cannot be promoted past the cap.
    let second = b.voice.register("stage", bob.clone(), "u2", "Bob").await;
    assert_eq!(second.participant.role, Role::Listener);
    let err = b
        .voice
        .set_role("stage", "u2", Role::Speaker, Actor::new("u2", ActorRole::Moderator))
        .await
        .unwrap_err();
    assert!(matches!(err, huddle_core::VoiceError::SpeakerLimitReached(1)));

    // Signals reach the other node's sockets.
    b.voice
        .relay_signal(
            "stage",
            "u2",
            SignalPayload::candidate(json!({"candidate": "a=candidate:1"})),
            &[bob.id().clone()],
        )
        .await;
    eventually(|| !alice.events("voice_signal").is_empty()).await;
    assert_eq!(alice.events("voice_signal")[0]["from"], "u2");
    assert!(bob.events("voice_signal").is_empty());

    // Node A merges Bob in from node B's published view.
    eventually(|| {
        alice
            .events("voice_state")
            .last()
            .is_some_and(|s| s["stats"]["total"] == 2)
    })
    .await;
    let snapshot = a.voice.snapshot("stage").await.unwrap();
    assert_eq!(snapshot.stats.speakers, 1);
    assert_eq!(snapshot.participants[1].user_id, "u2");
}

#[tokio::test]
async fn test_typing_refresh_outlives_peer_copy() {
    let ttl = Duration::from_millis(400);
    let bus = LocalBus::new();
    let a = Node::start_with("node-a", &bus, VoiceConfig::default(), ttl).await;
    let b = Node::start_with("node-b", &bus, VoiceConfig::default(), ttl).await;
    settle().await;

    assert!(a.typing.set_status("general", "u1", "Alice", true).await);
    let mut seen = false;
    for _ in 0..20 {
        if !b.typing.snapshot("general").await.is_empty() {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(seen);

    // The refresh is silent, so node B's copy still runs out at the
    // original deadline.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!a.typing.set_status("general", "u1", "Alice", true).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(b.typing.snapshot("general").await.is_empty());
    settle().await;

    // Node B's expiry of its copy never clears the refreshed indicator.
    let own = a.typing.snapshot("general").await;
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].user_id, "u1");
}

#[tokio::test]
async fn test_typing_stop_from_peer_clears_owner() {
    let bus = LocalBus::new();
    let a = Node::start("node-a", &bus, VoiceConfig::default()).await;
    let b = Node::start("node-b", &bus, VoiceConfig::default()).await;
    settle().await;

    assert!(a.typing.set_status("general", "u1", "Alice", true).await);
    let mut seen = false;
    for _ in 0..200 {
        if !b.typing.snapshot("general").await.is_empty() {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen);

    // Alice's socket on node B reports she stopped.
    assert!(b.typing.clear_user("general", "u1").await);
    for _ in 0..200 {
        if a.typing.snapshot("general").await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("typing indicator survived a stop from another node");
}

#[tokio::test]
async fn test_presence_survives_leave_while_connected_elsewhere() {
    let bus = LocalBus::new();
    let a = Node::start("node-a", &bus, VoiceConfig::default()).await;
    let b = Node::start("node-b", &bus, VoiceConfig::default()).await;
    settle().await;

    let watcher = Socket::new("watcher");
    let on_a = Socket::new("alice-a");
    let on_b = Socket::new("alice-b");
    a.presence
        .join("general", watcher.clone(), PresenceEntry::new("u0", "Watcher"))
        .await;
    a.presence
        .join("general", on_a.clone(), PresenceEntry::new("u1", "Alice"))
        .await;
    b.presence
        .join("general", on_b.clone(), PresenceEntry::new("u1", "Alice"))
        .await;
    eventually(|| b.presence.snapshot("general").len() == 2).await;
    settle().await;

    assert!(a.presence.leave("general", on_a.id(), "u1").await);
    settle().await;
    assert!(a.presence.is_online("general", "u1"));
    assert!(b.presence.is_online("general", "u1"));
    assert_eq!(a.presence.snapshot("general"), b.presence.snapshot("general"));
    assert!(watcher
        .events("presence")
        .iter()
        .all(|event| event["action"] != "leave"));

    // Her last socket anywhere closes.
    b.presence.leave_all(on_b.id()).await;
    eventually(|| !a.presence.is_online("general", "u1")).await;
    assert!(!b.presence.is_online("general", "u1"));
    eventually(|| {
        watcher
            .events("presence")
            .last()
            .is_some_and(|event| event["action"] == "leave" && event["user"]["user_id"] == "u1")
    })
    .await;
}

#[tokio::test]
async fn test_local_delivery_continues_while_bus_is_down() {
    let bus = LocalBus::new();
    let a = Node::start("node-a", &bus, VoiceConfig::default()).await;
    let b = Node::start("node-b", &bus, VoiceConfig::default()).await;
    settle().await;

    bus.sever();
    eventually(|| !a.transport.is_connected() && !b.transport.is_connected()).await;

    let watcher = Socket::new("watcher");
    let alice = Socket::new("alice");
    a.connections.connect(&typing_topic("general"), watcher.clone());
    a.presence
        .join("general", watcher.clone(), PresenceEntry::new("u0", "Watcher"))
        .await;
    assert!(a
        .presence
        .join("general", alice.clone(), PresenceEntry::new("u1", "Alice"))
        .await);
    assert_eq!(watcher.events("presence")[0]["user"]["user_id"], "u1");

    assert!(a.typing.set_status("general", "u1", "Alice", true).await);
    assert_eq!(watcher.events("typing").last().unwrap()["users"][0]["user_id"], "u1");

    let joined = a.voice.register("stage", alice.clone(), "u1", "Alice").await;
    assert!(joined.changed);
    assert!(!alice.events("voice_state").is_empty());

    // Nothing crossed to node B.
    settle().await;
    assert!(b.presence.snapshot("general").is_empty());
    assert!(b.voice.participant("stage", "u1").await.is_none());

    bus.restore();
    eventually(|| a.transport.is_connected() && b.transport.is_connected()).await;
    assert!(a.transport.restarts() >= 1);

    // Replication resumes without any resubscription by the managers.
    let bob = Socket::new("bob");
    b.presence
        .join("general", bob.clone(), PresenceEntry::new("u2", "Bob"))
        .await;
    eventually(|| a.presence.is_online("general", "u2")).await;
    assert!(a.connections.is_connected(&presence_topic("general"), watcher.id()));

    a.voice
        .set_muted("stage", "u1", true, Actor::this("u1"))
        .await
        .unwrap();
    for _ in 0..200 {
        if b.voice.participant("stage", "u1").await.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("voice state never reached node B after recovery");
}

