//! # huddle-protocol
//!
//! Wire formats shared by the huddle crates.
//!
//! - **Envelope** - JSON replication message published between nodes
//! - **Codec** - size-checked envelope encoding
//! - **STUN** - Allocate requests, long-term credentials and
//!   MESSAGE-INTEGRITY for the TURN health probe
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, Envelope};
//!
//! let envelope = Envelope::for_channel("join", "general").with_origin("node-a");
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert!(decoded.is_from("node-a"));
//! ```

pub mod codec;
pub mod envelope;
pub mod stun;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{topics, Envelope};
