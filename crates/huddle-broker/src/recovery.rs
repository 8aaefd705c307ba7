//! Single-flight reconnection coordinator.
//!
//! Readers and publishers call [`Recovery::trigger`] when they see an I/O
//! error. Only one recovery cycle runs at a time per backend; concurrent
//! triggers while a cycle is in flight are no-ops, except that a cycle which
//! releases its guard to find the backend marked down again goes round once
//! more. A cycle retries its attempt with exponential backoff until it
//! succeeds or the backend is stopped, and each success bumps the restart
//! counter exactly once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::metrics::{self, BackendLabels};
use crate::traits::{Backend, BrokerError};

/// Connection state and recovery bookkeeping for one backend.
pub struct Recovery {
    backend: Backend,
    backoff: BackoffConfig,
    in_flight: Arc<Mutex<()>>,
    connected: AtomicBool,
    restarts: AtomicU64,
    shutdown: CancellationToken,
}

impl Recovery {
    #[must_use]
    pub fn new(backend: Backend, backoff: BackoffConfig) -> Arc<Self> {
        Arc::new(Self {
            backend,
            backoff,
            in_flight: Arc::new(Mutex::new(())),
            connected: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Record a successful initial connection.
    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
    }

    /// Record a lost connection without starting recovery.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_recovering(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Completed recovery cycles.
    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop any running cycle and refuse new ones.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.mark_disconnected();
    }

    /// Mark the backend disconnected and start a recovery cycle unless one
    /// is already running.
    ///
    /// `attempt` must tear down and recreate the connection and restore
    /// every registered subscription; the backend counts as connected again
    /// only after it returns `Ok`.
    ///
    /// Returns `true` if this call started a new cycle.
    pub fn trigger<F, Fut>(self: &Arc<Self>, attempt: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BrokerError>> + Send + 'static,
    {
        self.mark_disconnected();
        if self.is_stopped() {
            return false;
        }

        let Ok(guard) = Arc::clone(&self.in_flight).try_lock_owned() else {
            return false;
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut guard = guard;
            loop {
                if !this.run_cycle(&attempt).await {
                    return;
                }
                drop(guard);

                // A trigger that lost the race for the guard after this
                // cycle reconnected has marked the backend down again.
                if this.is_connected() || this.is_stopped() {
                    return;
                }
                match Arc::clone(&this.in_flight).try_lock_owned() {
                    Ok(next) => guard = next,
                    Err(_) => return,
                }
            }
        });

        true
    }

    /// Retry `attempt` until it succeeds. Returns `false` if the backend
    /// was stopped first.
    async fn run_cycle<F, Fut>(&self, attempt: &F) -> bool
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), BrokerError>>,
    {
        let mut backoff = ExponentialBackoff::new(self.backoff);
        loop {
            if self.is_stopped() {
                return false;
            }

            match attempt().await {
                Ok(()) => {
                    self.mark_connected();
                    let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
                    metrics::record_restart(&BackendLabels::new(self.backend));
                    info!(backend = %self.backend, restarts, "Broker connection restored");
                    return true;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        backend = %self.backend,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Broker recovery attempt failed"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn settle(recovery: &Recovery) {
        for _ in 0..200 {
            if !recovery.is_recovering() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("recovery did not finish");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success_and_counts_once() {
        let recovery = Recovery::new(Backend::Redis, BackoffConfig::default());
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&attempts);
        assert!(recovery.trigger(move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BrokerError::unavailable(Backend::Redis, "refused"))
                } else {
                    Ok(())
                }
            }
        }));

        assert!(!recovery.is_connected());
        settle(&recovery).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(recovery.is_connected());
        assert_eq!(recovery.restarts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight() {
        let recovery = Recovery::new(Backend::Local, BackoffConfig::default());
        let attempts = Arc::new(AtomicUsize::new(0));

        let make = |counter: Arc<AtomicUsize>| {
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(())
                }
            }
        };

        assert!(recovery.trigger(make(Arc::clone(&attempts))));
        tokio::task::yield_now().await;
        assert!(!recovery.trigger(make(Arc::clone(&attempts))));
        assert!(!recovery.trigger(make(Arc::clone(&attempts))));

        settle(&recovery).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(recovery.restarts(), 1);

        // A later failure starts a fresh cycle.
        assert!(recovery.trigger(make(Arc::clone(&attempts))));
        settle(&recovery).await;
        assert_eq!(recovery.restarts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_cycle() {
        let recovery = Recovery::new(Backend::Redis, BackoffConfig::default());
        recovery.trigger(|| async { Err(BrokerError::unavailable(Backend::Redis, "down")) });
        tokio::time::sleep(Duration::from_secs(5)).await;

        recovery.stop();
        settle(&recovery).await;
        assert!(!recovery.is_connected());
        assert_eq!(recovery.restarts(), 0);
        assert!(!recovery.trigger(|| async { Ok(()) }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_trigger_racing_cycle_end_still_reconnects() {
        for _ in 0..200 {
            let recovery = Recovery::new(Backend::Local, BackoffConfig::default());
            recovery.trigger(|| async { Ok(()) });

            let racer = Arc::clone(&recovery);
            tokio::spawn(async move {
                racer.trigger(|| async { Ok(()) });
            })
            .await
            .unwrap();

            let mut connected = false;
            for _ in 0..2000 {
                if recovery.is_connected() && !recovery.is_recovering() {
                    connected = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            assert!(connected, "backend left disconnected with no cycle running");
        }
    }
}
