//! # huddle-probe
//!
//! Health probe for STUN/TURN relays.
//!
//! Each configured `turn:`/`turns:` URL expands into endpoints on the
//! well-known ports plus any explicit port. Every endpoint gets an
//! unauthenticated Allocate, then an authenticated one answering the
//! server's REALM/NONCE challenge, and the outcome is exported as
//! Prometheus gauges and counters.
//!
//! ## Example
//!
//! ```rust,no_run
//! use huddle_probe::{Credentials, ProbeConfig, Prober};
//!
//! # async fn run() -> Result<(), huddle_probe::TurnError> {
//! let prober = Prober::new(
//!     &["turn:relay.example.com"],
//!     ProbeConfig {
//!         credentials: Some(Credentials::new("probe", "secret")),
//!         ..ProbeConfig::default()
//!     },
//! )?;
//! for result in prober.run_once().await {
//!     println!("{} auth_valid={}", result.endpoint, result.auth_valid);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod probe;
pub mod run;

pub use endpoint::{expand_all, Transport, TurnEndpoint, DEFAULT_TURNS_PORT, DEFAULT_TURN_PORT};
pub use error::TurnError;
pub use probe::{check, Credentials, ProbeConfig, TurnCheckResult};
pub use run::Prober;
