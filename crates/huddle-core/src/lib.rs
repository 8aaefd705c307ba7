//! # huddle-core
//!
//! Presence, typing and voice coordination for the huddle realtime layer.
//!
//! This crate provides the managers a WebSocket layer drives:
//!
//! - **ConnectionManager** - Per-topic sets of local sockets and fan-out
//! - **PresenceManager** - Who is online in each channel
//! - **TypingManager** - Typing indicators with TTL expiry
//! - **VoiceSignalManager** - Voice room state, stage status and signaling relay
//!
//! Every manager delivers locally first and then replicates through the
//! broker transport; envelopes this node published are dropped on receipt.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌───────────────────┐
//! │  WebSocket  │────▶│  Presence/Typing │────▶│ ConnectionManager │
//! │   handler   │     │  Voice managers  │     └───────────────────┘
//! └─────────────┘     └──────────────────┘
//!                            │    ▲
//!                   publish  ▼    │ remote envelopes (self-echo dropped)
//!                     ┌──────────────────┐
//!                     │ BrokerTransport  │
//!                     └──────────────────┘
//! ```

pub mod connection;
pub mod metrics;
pub mod presence;
pub mod replicate;
pub mod typing;
pub mod voice;

#[cfg(test)]
mod testing;

pub use connection::{Connection, ConnectionId, ConnectionManager, DeliveryReport, SendError};
pub use presence::{Departure, Joined, PresenceEntry, PresenceManager, PresenceStore};
pub use replicate::{ReplicaSink, Replicator};
pub use typing::{Swept, TypingEntry, TypingManager, TypingStore, DEFAULT_TYPING_TTL};
pub use voice::{Mutation, VoiceConfig, VoiceError, VoiceSignalManager};
