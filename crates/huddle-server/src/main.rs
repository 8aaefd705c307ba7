//! # Huddle Server
//!
//! Presence, typing and voice coordination behind an authenticating proxy.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (single node, in-process bus)
//! huddle
//!
//! # Join a Redis-backed cluster
//! HUDDLE__BROKER__BACKEND=redis HUDDLE__BROKER__REDIS_URL=redis://cache:6379 huddle
//!
//! # Run with an explicit config file
//! HUDDLE_CONFIG=/path/to/huddle.toml huddle
//! ```

mod commands;
mod config;
mod handlers;
mod metrics;
mod state;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::var_os("HUDDLE_CONFIG") {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!(
        node = %config.server.node_id,
        "Starting huddle server on {}:{}",
        config.server.host,
        config.server.port
    );

    if config.metrics.enabled {
        match metrics::start_metrics_server(config.metrics.port) {
            Ok(()) => metrics::init_metrics(),
            Err(e) => tracing::error!(error = %e, "Metrics disabled"),
        }
    }

    handlers::run_server(config).await
}
