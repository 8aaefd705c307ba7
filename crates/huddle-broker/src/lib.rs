//! # huddle-broker
//!
//! Broker transport for the huddle realtime layer.
//!
//! Managers replicate their events to sibling nodes through a pluggable
//! pub/sub backend:
//!
//! - **Redis** - one reader task per subscription, single-flight recovery
//!   with exponential backoff (feature `redis`, on by default)
//! - **NATS** - relies on the client's own reconnection (feature `nats`)
//! - **Local** - in-process bus for single-node deployments and tests
//!
//! ## Degraded mode
//!
//! When no backend is reachable every operation returns
//! [`BrokerError::TransportUnavailable`]; callers keep delivering to their
//! local connections and only cross-node consistency is lost until the
//! backend recovers.
//!
//! ```rust,ignore
//! use huddle_broker::{BrokerTransport, LocalBroker, LocalBus};
//!
//! let transport = BrokerTransport::local_only()
//!     .with_prefix("huddle")
//!     .with_broker(Arc::new(LocalBroker::new(LocalBus::new())));
//! transport.start().await;
//! transport.publish("presence", payload, None).await?;
//! ```

pub mod backoff;
pub mod local;
pub mod metrics;
pub mod recovery;
pub mod subscription;
pub mod traits;
pub mod transport;

#[cfg(feature = "redis")]
pub mod redis_broker;

#[cfg(feature = "nats")]
pub mod nats_broker;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use local::{LocalBroker, LocalBus};
pub use recovery::Recovery;
pub use subscription::Subscription;
pub use traits::{Backend, Broker, BrokerError, MessageHandler};
pub use transport::BrokerTransport;

#[cfg(feature = "redis")]
pub use redis_broker::RedisBroker;

#[cfg(feature = "nats")]
pub use nats_broker::NatsBroker;
