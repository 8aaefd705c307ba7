//! Probe runs over every configured endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::ClientConfig;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::client::tls_config;
use crate::endpoint::{expand_all, TurnEndpoint};
use crate::error::TurnError;
use crate::metrics;
use crate::probe::{check, ProbeConfig, TurnCheckResult};

/// Checks a fixed set of endpoints on demand or on an interval.
pub struct Prober {
    endpoints: Vec<TurnEndpoint>,
    config: Arc<ProbeConfig>,
    tls: Arc<ClientConfig>,
}

impl Prober {
    /// Build a prober for `urls`.
    ///
    /// # Errors
    ///
    /// Returns [`TurnError::Configuration`] if a URL cannot be parsed.
    pub fn new<S: AsRef<str>>(urls: &[S], config: ProbeConfig) -> Result<Self, TurnError> {
        Ok(Self::with_endpoints(expand_all(urls)?, config))
    }

    /// Build a prober for explicit endpoints, skipping URL expansion.
    #[must_use]
    pub fn with_endpoints(endpoints: Vec<TurnEndpoint>, config: ProbeConfig) -> Self {
        Self {
            endpoints,
            config: Arc::new(config),
            tls: tls_config(),
        }
    }

    #[must_use]
    pub fn endpoints(&self) -> &[TurnEndpoint] {
        &self.endpoints
    }

    /// Check every endpoint concurrently and record metrics.
    ///
    /// One result per endpoint, in endpoint order. A check that panics is
    /// reported as an `unexpected` failure.
    pub async fn run_once(&self) -> Vec<TurnCheckResult> {
        let started = Instant::now();

        let handles: Vec<_> = self
            .endpoints
            .iter()
            .map(|endpoint| {
                let target = endpoint.clone();
                let config = Arc::clone(&self.config);
                let tls = Arc::clone(&self.tls);
                let task = tokio::spawn(async move { check(target, &config, &tls).await });
                (endpoint.clone(), task)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (endpoint, task) in handles {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(endpoint = %endpoint, error = %e, "TURN check task failed");
                    TurnCheckResult::failed(
                        endpoint,
                        started.elapsed(),
                        TurnError::Unexpected(e.to_string()),
                    )
                }
            };
            metrics::record(&result);
            results.push(result);
        }

        let failed = results.iter().filter(|r| !r.is_success()).count();
        if failed == 0 {
            info!(endpoints = results.len(), "TURN probe run passed");
        } else {
            warn!(endpoints = results.len(), failed, "TURN probe run had failures");
        }
        results
    }

    /// Run every `interval` until `shutdown` flips to `true`.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("TURN probe stopping");
                        return;
                    }
                }
            }
        }
    }
}
