//! Fire-and-forget HTTP notifications for quality reports and recording
//! changes.
//!
//! Each POST runs as a task in a [`JoinSet`] owned by the notifier, so
//! shutdown can wait for in-flight requests instead of dropping them.

use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::state::RecordingState;

/// Webhook endpoints.
#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    pub quality_url: Option<String>,
    pub recording_url: Option<String>,
    pub timeout: Duration,
}

/// Posts voice events to configured webhooks.
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: WebhookConfig,
    tasks: Mutex<JoinSet<()>>,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new(config: WebhookConfig) -> Self {
        let mut builder = reqwest::Client::builder();
        if !config.timeout.is_zero() {
            builder = builder.timeout(config.timeout);
        }
        let client = builder.build().unwrap_or_else(|e| {
            warn!(error = %e, "Webhook client build failed, using defaults");
            reqwest::Client::new()
        });

        Self {
            client,
            config,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// A notifier with no endpoints.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(WebhookConfig::default())
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.quality_url.is_some() || self.config.recording_url.is_some()
    }

    pub async fn notify_quality(&self, room: &str, user_id: &str, report: &Map<String, Value>) {
        if let Some(url) = &self.config.quality_url {
            let body = json!({
                "event": "voice.quality",
                "room": room,
                "user_id": user_id,
                "metrics": report,
            });
            self.post(url.clone(), body).await;
        }
    }

    pub async fn notify_recording(&self, room: &str, state: &RecordingState) {
        if let Some(url) = &self.config.recording_url {
            let body = json!({
                "event": "voice.recording",
                "room": room,
                "recording": state,
            });
            self.post(url.clone(), body).await;
        }
    }

    async fn post(&self, url: String, body: Value) {
        let client = self.client.clone();
        let mut tasks = self.tasks.lock().await;
        // Reap finished requests so the set does not grow unbounded.
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %url, "Webhook delivered");
                }
                Ok(response) => {
                    warn!(url = %url, status = %response.status(), "Webhook rejected");
                }
                Err(e) => warn!(url = %url, error = %e, "Webhook failed"),
            }
        });
    }

    /// Requests still in flight.
    pub async fn pending(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Wait up to `timeout` for in-flight requests, then abort the rest.
    pub async fn drain(&self, timeout: Duration) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        if tasks.is_empty() {
            return;
        }

        let waited = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if waited.is_err() {
            warn!(remaining = tasks.len(), "Aborting unfinished webhooks");
            tasks.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_notifier_spawns_nothing() {
        let notifier = WebhookNotifier::disabled();
        assert!(!notifier.is_enabled());

        notifier.notify_quality("r1", "u1", &Map::new()).await;
        notifier
            .notify_recording(
                "r1",
                &RecordingState {
                    active: true,
                    timestamp: 0,
                    by: None,
                },
            )
            .await;
        assert_eq!(notifier.pending().await, 0);
        notifier.drain(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_drain_bounds_unreachable_endpoint() {
        let notifier = WebhookNotifier::new(WebhookConfig {
            quality_url: Some("http://127.0.0.1:9/quality".to_string()),
            recording_url: None,
            timeout: Duration::from_millis(200),
        });
        notifier.notify_quality("r1", "u1", &Map::new()).await;
        assert!(notifier.pending().await <= 1);

        tokio::time::timeout(Duration::from_secs(5), notifier.drain(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(notifier.pending().await, 0);
    }
}
