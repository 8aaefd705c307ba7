//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults for every field
//! - The first TOML file found among `huddle.toml`,
//!   `/etc/huddle/huddle.toml` and `~/.config/huddle/huddle.toml`
//! - Environment variables `HUDDLE__<SECTION>__<KEY>`, e.g.
//!   `HUDDLE__SERVER__PORT=9000`

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use huddle_broker::BackoffConfig;
use huddle_core::voice::{Role, WebhookConfig};
use huddle_core::VoiceConfig;
use serde::{Deserialize, Deserializer, Serialize};

const CONFIG_PATHS: [&str; 3] = [
    "huddle.toml",
    "/etc/huddle/huddle.toml",
    "~/.config/huddle/huddle.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub typing: TypingConfig,

    #[serde(default)]
    pub voice: VoiceSettings,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Listener and node identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Identity stamped on replicated envelopes. Random per process unless
    /// set.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Which pub/sub backend replicates events between nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    Redis,
    Nats,
    /// In-process bus: a single node that still exercises replication.
    #[default]
    Local,
    /// No replication at all.
    None,
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BackendChoice,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Namespace for broker topics, shared by every node of a deployment.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,
}

/// Typing indicator timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    #[serde(default = "default_typing_ttl")]
    pub ttl_ms: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

/// Voice room policy and webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSettings {
    /// Speakers allowed per room; unlimited when unset.
    #[serde(default)]
    pub max_speakers: Option<usize>,

    /// Role on join. Anything but `speaker` becomes `listener`.
    #[serde(default = "default_role", deserialize_with = "clamped_role")]
    pub default_role: Role,

    #[serde(default = "default_true")]
    pub auto_promote_first_speaker: bool,

    #[serde(default)]
    pub quality_webhook_url: Option<String>,

    #[serde(default)]
    pub recording_webhook_url: Option<String>,

    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_topic_prefix() -> String {
    "huddle".to_string()
}

fn default_backoff_base() -> u64 {
    500
}

fn default_backoff_cap() -> u64 {
    30_000
}

fn default_typing_ttl() -> u64 {
    8_000
}

fn default_sweep_interval() -> u64 {
    2_000
}

fn default_role() -> Role {
    Role::Listener
}

fn clamped_role<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Role, D::Error> {
    let value = String::deserialize(deserializer)?;
    Ok(Role::clamp(&value))
}

fn default_true() -> bool {
    true
}

fn default_webhook_timeout() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            node_id: default_node_id(),
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::default(),
            redis_url: default_redis_url(),
            nats_url: default_nats_url(),
            topic_prefix: default_topic_prefix(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_typing_ttl(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            max_speakers: None,
            default_role: default_role(),
            auto_promote_first_speaker: true,
            quality_webhook_url: None,
            recording_webhook_url: None,
            webhook_timeout_ms: default_webhook_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl BrokerConfig {
    #[must_use]
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms.max(self.backoff_base_ms)),
        }
    }
}

impl TypingConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl VoiceSettings {
    #[must_use]
    pub fn policy(&self) -> VoiceConfig {
        VoiceConfig {
            max_speakers: self.max_speakers,
            default_role: self.default_role,
            auto_promote_first_speaker: self.auto_promote_first_speaker,
        }
    }

    #[must_use]
    pub fn webhooks(&self) -> WebhookConfig {
        WebhookConfig {
            quality_url: self.quality_webhook_url.clone(),
            recording_url: self.recording_webhook_url.clone(),
            timeout: Duration::from_millis(self.webhook_timeout_ms),
        }
    }
}

impl Config {
    /// Load from the first config file found, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let path = CONFIG_PATHS
            .iter()
            .map(|p| shellexpand::tilde(p).into_owned())
            .find(|p| Path::new(p).exists());
        Self::layered(path.as_deref())
    }

    /// Load a specific file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path = path
            .to_str()
            .with_context(|| format!("Config path is not UTF-8: {}", path.display()))?;
        Self::layered(Some(path))
    }

    fn layered(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            tracing::info!(path = %path, "Loading configuration");
            builder = builder.add_source(config::File::new(path, config::FileFormat::Toml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("HUDDLE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Socket address for the HTTP listener.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form an address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.server.host, self.server.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.broker.backend, BackendChoice::Local);
        assert_eq!(config.broker.backoff().base, Duration::from_millis(500));
        assert_eq!(config.broker.backoff().cap, Duration::from_secs(30));
        assert_eq!(config.typing.ttl(), Duration::from_secs(8));
        assert!(config.voice.policy().auto_promote_first_speaker);
        assert!(!config.server.node_id.is_empty());
    }

    #[test]
    fn test_node_ids_differ_per_process_default() {
        assert_ne!(Config::default().server.node_id, Config::default().server.node_id);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let mut bad = Config::default();
        bad.server.host = "not a host".to_string();
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 9000
            node_id = "node-a"

            [broker]
            backend = "redis"
            redis_url = "redis://cache:6379"

            [voice]
            max_speakers = 4
            default_role = "speaker"
            quality_webhook_url = "http://hooks/quality"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.node_id, "node-a");
        assert_eq!(config.broker.backend, BackendChoice::Redis);
        assert_eq!(config.broker.topic_prefix, "huddle");
        assert_eq!(config.voice.policy().max_speakers, Some(4));
        assert_eq!(config.voice.policy().default_role, Role::Speaker);
        assert_eq!(
            config.voice.webhooks().quality_url.as_deref(),
            Some("http://hooks/quality")
        );
        assert_eq!(config.typing.sweep_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_default_role_is_clamped() {
        for (configured, expected) in [
            ("speaker", Role::Speaker),
            ("Speaker", Role::Speaker),
            ("listener", Role::Listener),
            ("moderator", Role::Listener),
            ("admin", Role::Listener),
        ] {
            let toml_str = format!("[voice]\ndefault_role = \"{configured}\"\n");
            let config: Config = toml::from_str(&toml_str).unwrap();
            assert_eq!(config.voice.policy().default_role, expected, "{configured}");
        }
    }

    #[test]
    fn test_default_role_from_layered_file() {
        let path = std::env::temp_dir().join(format!("huddle-role-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[voice]\ndefault_role = \"moderator\"\n").unwrap();
        let config = Config::from_file(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.unwrap().voice.default_role, Role::Listener);
    }
}
