//! HTTP routes and the WebSocket session loop.
//!
//! Each socket gets a [`WsConnection`] registered with the managers. Its
//! sends go through a bounded queue drained by a writer task, so a slow
//! client never stalls a broadcast to everyone else.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use huddle_core::typing::typing_topic;
use huddle_core::voice::{Role, VoiceError};
use huddle_core::{Connection, ConnectionId, SendError};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::commands::{Command, Identity};
use crate::config::Config;
use crate::metrics::{self, CommandErrorLabels, SessionGuard};
use crate::state::AppState;

/// Outbound messages buffered per socket before sends start failing.
const OUTBOUND_QUEUE: usize = 256;

/// How long the writer may keep flushing after the session ends.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// A WebSocket as the managers see it.
pub struct WsConnection {
    id: ConnectionId,
    outbound: mpsc::Sender<String>,
}

impl WsConnection {
    #[must_use]
    pub fn new(outbound: mpsc::Sender<String>) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::generate(),
            outbound,
        })
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send(&self, payload: &Value) -> Result<(), SendError> {
        let text = serde_json::to_string(payload)?;
        self.outbound.try_send(text).map_err(|e| match e {
            TrySendError::Closed(_) => SendError::Closed,
            TrySendError::Full(_) => SendError::Other("outbound queue full".to_string()),
        })
    }
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let websocket_path = config.server.websocket_path.clone();
    let state = Arc::new(AppState::start(config).await);

    let app = Router::new()
        .route(&websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Huddle server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, websocket_path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Ctrl-C handler unavailable");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let backend = state.transport.default_backend();
    let connected = state.transport.is_connected();
    let status = if backend.is_none() || connected {
        "ok"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "node_id": state.config.server.node_id,
        "broker": {
            "backend": backend.map(|b| b.as_str()),
            "connected": connected,
            "restarts": state.transport.restarts(),
        },
    }))
}

/// WebSocket upgrade handler. The upstream proxy has already authenticated
/// the user and passes the identity in headers.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(identity) = Identity::from_headers(&headers) else {
        return (StatusCode::UNAUTHORIZED, "missing identity headers").into_response();
    };
    ws.on_upgrade(move |socket| handle_websocket(socket, state, identity))
}

async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let _session = SessionGuard::new();

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let conn = WsConnection::new(tx);

    debug!(connection = %conn.id(), user = %identity.user_id, "WebSocket connected");

    let mut writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let hello = json!({
        "type": "connected",
        "connection_id": conn.id().as_str(),
        "node_id": state.config.server.node_id,
        "user_id": identity.user_id,
    });
    let _ = conn.send(&hello).await;

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_text(&state, &conn, &identity, &text).await,
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => handle_text(&state, &conn, &identity, text).await,
                Err(_) => reject(&conn, "unknown", "bad_command", "binary frame is not UTF-8").await,
            },
            Ok(Message::Close(_)) => {
                debug!(connection = %conn.id(), "Received close frame");
                break;
            }
            // Pings are answered by axum.
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                warn!(connection = %conn.id(), error = %e, "WebSocket error");
                break;
            }
        }
    }

    disconnect(&state, &conn, &identity).await;
    drop(conn);
    if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
}

/// Remove a closed socket from every manager.
async fn disconnect(state: &AppState, conn: &Arc<WsConnection>, identity: &Identity) {
    let channels = state.presence.leave_all(conn.id()).await;
    let typing = state.typing.clear_user_everywhere(&identity.user_id).await;
    let rooms = state.voice.unregister_connection(conn.id()).await;
    state.connections.disconnect_all(conn.id());

    debug!(
        connection = %conn.id(),
        channels = channels.len(),
        typing,
        rooms = rooms.len(),
        "WebSocket disconnected"
    );
}

async fn handle_text(state: &AppState, conn: &Arc<WsConnection>, identity: &Identity, text: &str) {
    let command = match serde_json::from_str::<Command>(text) {
        Ok(command) => command,
        Err(e) => {
            reject(conn, "unknown", "bad_command", &e.to_string()).await;
            return;
        }
    };

    let name = command.name();
    metrics::record_command(name);
    if let Err(e) = dispatch(state, conn, identity, command).await {
        debug!(connection = %conn.id(), command = name, error = %e, "Command rejected");
        reject(conn, name, e.reason(), &e.to_string()).await;
    }
}

async fn reject(conn: &Arc<WsConnection>, command: &'static str, reason: &'static str, message: &str) {
    metrics::record_command_error(CommandErrorLabels { command, reason });
    let error = json!({
        "type": "error",
        "command": command,
        "reason": reason,
        "message": message,
    });
    let _ = conn.send(&error).await;
}

/// Apply one command. Errors go back to the sender only.
async fn dispatch(
    state: &AppState,
    conn: &Arc<WsConnection>,
    identity: &Identity,
    command: Command,
) -> Result<(), VoiceError> {
    let socket: Arc<dyn Connection> = Arc::clone(conn) as Arc<dyn Connection>;
    let actor = identity.actor();
    let me = identity.user_id.as_str();

    match command {
        Command::Join {
            channel_id,
            status,
            avatar_url,
        } => {
            state
                .connections
                .connect(&typing_topic(&channel_id), Arc::clone(&socket));
            state
                .presence
                .join(&channel_id, socket, identity.presence(status, avatar_url))
                .await;

            let users = state.typing.snapshot(&channel_id).await;
            if !users.is_empty() {
                let typing = json!({"type": "typing", "channel_id": channel_id, "users": users});
                let _ = conn.send(&typing).await;
            }
        }
        Command::Leave { channel_id } => {
            state
                .connections
                .disconnect(&typing_topic(&channel_id), conn.id());
            state.presence.leave(&channel_id, conn.id(), me).await;
            state.typing.clear_user(&channel_id, me).await;
        }
        Command::UpdatePresence { status, avatar_url } => {
            state
                .presence
                .refresh_user(identity.presence(status, avatar_url))
                .await;
        }
        Command::Typing {
            channel_id,
            is_typing,
        } => {
            state
                .typing
                .set_status(&channel_id, me, &identity.display_name, is_typing)
                .await;
        }
        Command::VoiceJoin { room } => {
            state
                .voice
                .register(&room, socket, me, &identity.display_name)
                .await;
        }
        Command::VoiceLeave { room } => {
            state.voice.unregister(&room, conn.id(), me).await;
        }
        Command::SetRole {
            room,
            user_id,
            role,
        } => {
            let role: Role = role.parse()?;
            // Stepping down is always allowed; going on stage needs a moderator.
            if role == Role::Speaker && !identity.role.is_elevated() {
                return Err(VoiceError::InsufficientPermission);
            }
            let target = user_id.as_deref().unwrap_or(me);
            state.voice.set_role(&room, target, role, actor).await?;
        }
        Command::SetMuted {
            room,
            user_id,
            muted,
        } => {
            let target = user_id.as_deref().unwrap_or(me);
            state.voice.set_muted(&room, target, muted, actor).await?;
        }
        Command::SetDeafened {
            room,
            user_id,
            deafened,
        } => {
            let target = user_id.as_deref().unwrap_or(me);
            state.voice.set_deafened(&room, target, deafened, actor).await?;
        }
        Command::SetVideo {
            room,
            user_id,
            enabled,
        } => {
            let target = user_id.as_deref().unwrap_or(me);
            state.voice.set_video_state(&room, target, enabled, actor).await?;
        }
        Command::SetStageStatus {
            room,
            user_id,
            status,
        } => {
            let target = user_id.as_deref().unwrap_or(me);
            state
                .voice
                .set_stage_status(&room, target, status.as_deref(), actor)
                .await?;
        }
        Command::RaiseHand {
            room,
            user_id,
            raised,
        } => {
            let target = user_id.as_deref().unwrap_or(me);
            state
                .voice
                .set_hand_raised(&room, target, raised, actor)
                .await?;
        }
        Command::QualityReport { room, metrics } => {
            state.voice.record_quality(&room, me, metrics).await?;
        }
        Command::Recording { room, active } => {
            if !identity.role.is_elevated() {
                return Err(VoiceError::InsufficientPermission);
            }
            state.voice.set_recording_state(&room, active, me).await?;
        }
        Command::Signal { room, signal } => {
            state
                .voice
                .relay_signal(&room, me, signal, std::slice::from_ref(conn.id()))
                .await;
        }
        Command::Ping => {
            let _ = conn.send(&json!({"type": "pong"})).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendChoice;
    use huddle_core::voice::ActorRole;

    async fn node() -> AppState {
        let mut config = Config::default();
        config.broker.backend = BackendChoice::None;
        AppState::start(config).await
    }

    fn client(user_id: &str, role: ActorRole) -> (Arc<WsConnection>, mpsc::Receiver<String>, Identity) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let identity = Identity {
            user_id: user_id.to_string(),
            display_name: user_id.to_uppercase(),
            role,
        };
        (WsConnection::new(tx), rx, identity)
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(text) = rx.try_recv() {
            events.push(serde_json::from_str(&text).unwrap());
        }
        events
    }

    async fn send(state: &AppState, conn: &Arc<WsConnection>, identity: &Identity, command: Value) {
        handle_text(state, conn, identity, &command.to_string()).await;
    }

    #[tokio::test]
    async fn test_join_and_typing_reach_channel() {
        let state = node().await;
        let (alice, mut alice_rx, alice_id) = client("u1", ActorRole::Member);
        let (bob, mut bob_rx, bob_id) = client("u2", ActorRole::Member);

        send(&state, &alice, &alice_id, json!({"type": "join", "channel_id": "general"})).await;
        send(&state, &bob, &bob_id, json!({"type": "join", "channel_id": "general"})).await;

        let events = drain(&mut alice_rx);
        assert_eq!(events[0]["type"], "presence_snapshot");
        assert_eq!(events[1]["action"], "join");
        assert_eq!(events[1]["user"]["user_id"], "u2");
        drain(&mut bob_rx);

        send(&state, &bob, &bob_id, json!({"type": "typing", "channel_id": "general", "is_typing": true})).await;
        let events = drain(&mut alice_rx);
        assert_eq!(events[0]["type"], "typing");
        assert_eq!(events[0]["users"][0]["user_id"], "u2");

        disconnect(&state, &bob, &bob_id).await;
        let events = drain(&mut alice_rx);
        assert!(events.iter().any(|e| e["type"] == "presence" && e["action"] == "leave"));
        assert!(state.typing.snapshot("general").await.is_empty());

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_member_cannot_take_the_stage() {
        let state = node().await;
        let (alice, mut alice_rx, alice_id) = client("u1", ActorRole::Member);
        let (bob, mut bob_rx, bob_id) = client("u2", ActorRole::Member);

        send(&state, &alice, &alice_id, json!({"type": "voice_join", "room": "stage"})).await;
        send(&state, &bob, &bob_id, json!({"type": "voice_join", "room": "stage"})).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        send(&state, &bob, &bob_id, json!({"type": "set_role", "room": "stage", "role": "speaker"})).await;
        let events = drain(&mut bob_rx);
        assert_eq!(events[0]["type"], "error");
        assert_eq!(events[0]["reason"], "permission");

        send(&state, &bob, &bob_id, json!({"type": "set_muted", "room": "stage", "user_id": "u1", "muted": true})).await;
        assert_eq!(drain(&mut bob_rx)[0]["reason"], "permission");

        send(&state, &bob, &bob_id, json!({"type": "set_role", "room": "stage", "role": "boss"})).await;
        assert_eq!(drain(&mut bob_rx)[0]["reason"], "invalid_role");

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_moderator_promotes_and_signal_skips_sender() {
        let state = node().await;
        let (alice, mut alice_rx, alice_id) = client("u1", ActorRole::Moderator);
        let (bob, mut bob_rx, bob_id) = client("u2", ActorRole::Member);

        send(&state, &alice, &alice_id, json!({"type": "voice_join", "room": "stage"})).await;
        send(&state, &bob, &bob_id, json!({"type": "voice_join", "room": "stage"})).await;
        send(
            &state,
            &alice,
            &alice_id,
            json!({"type": "set_role", "room": "stage", "user_id": "u2", "role": "speaker"}),
        )
        .await;
        let bob_view = state.voice.participant("stage", "u2").await.unwrap();
        assert_eq!(bob_view.role, Role::Speaker);
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        send(
            &state,
            &bob,
            &bob_id,
            json!({"type": "signal", "room": "stage", "signal": {"kind": "offer", "description": {"sdp": "v=0"}}}),
        )
        .await;
        let heard = drain(&mut alice_rx);
        assert_eq!(heard[0]["type"], "voice_signal");
        assert_eq!(heard[0]["from"], "u2");
        assert!(drain(&mut bob_rx).is_empty());

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_command_is_reported() {
        let state = node().await;
        let (alice, mut rx, identity) = client("u1", ActorRole::Member);

        handle_text(&state, &alice, &identity, "{\"type\":\"shout\"}").await;
        let events = drain(&mut rx);
        assert_eq!(events[0]["reason"], "bad_command");

        send(&state, &alice, &identity, json!({"type": "recording", "room": "r", "active": true})).await;
        assert_eq!(drain(&mut rx)[0]["reason"], "permission");

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_fails_the_send() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = WsConnection::new(tx);
        conn.send(&json!({"n": 1})).await.unwrap();
        assert!(matches!(conn.send(&json!({"n": 2})).await, Err(SendError::Other(_))));
    }
}
