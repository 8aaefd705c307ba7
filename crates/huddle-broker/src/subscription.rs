//! Subscription handles and the per-backend subscription table.
//!
//! Every backend keeps its live subscriptions in a [`SubscriptionTable`] so
//! that a recovery cycle can re-create each reader without the caller
//! subscribing again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::{self, BackendLabels};
use crate::traits::{Backend, MessageHandler};

/// A background reader task and its cancellation token.
pub(crate) struct ReaderHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaderHandle {
    pub(crate) fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    /// Cancel the reader and wait for it to finish.
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

struct Entry {
    topic: String,
    handler: Arc<dyn MessageHandler>,
    reader: Option<ReaderHandle>,
}

/// Registered subscriptions of one backend.
pub(crate) struct SubscriptionTable {
    backend: Backend,
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl SubscriptionTable {
    pub(crate) fn new(backend: Backend) -> Arc<Self> {
        Arc::new(Self {
            backend,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) async fn insert(
        self: &Arc<Self>,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        reader: ReaderHandle,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().await.insert(
            id,
            Entry {
                topic: topic.to_string(),
                handler,
                reader: Some(reader),
            },
        );
        metrics::subscription_opened(&BackendLabels::new(self.backend));
        debug!(backend = %self.backend, topic = %topic, id, "Subscription registered");

        Subscription {
            id,
            topic: topic.to_string(),
            backend: self.backend,
            table: Arc::clone(self),
            closed: AtomicBool::new(false),
        }
    }

    /// Every registered subscription as `(id, topic, handler)`.
    pub(crate) async fn registered(&self) -> Vec<(u64, String, Arc<dyn MessageHandler>)> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(id, e)| (*id, e.topic.clone(), Arc::clone(&e.handler)))
            .collect()
    }

    /// Install a new reader for `id`, shutting the previous one down.
    ///
    /// If the subscription was closed in the meantime the new reader is
    /// shut down instead.
    pub(crate) async fn replace_reader(&self, id: u64, reader: ReaderHandle) {
        let previous = {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(&id) {
                Some(entry) => entry.reader.replace(reader),
                None => Some(reader),
            }
        };
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
    }

    /// Remove one subscription and stop its reader. Idempotent.
    pub(crate) async fn release(&self, id: u64) {
        let entry = self.entries.lock().await.remove(&id);
        if let Some(entry) = entry {
            if let Some(reader) = entry.reader {
                reader.shutdown().await;
            }
            metrics::subscription_closed(&BackendLabels::new(self.backend));
            debug!(backend = %self.backend, topic = %entry.topic, id, "Subscription released");
        }
    }

    /// Remove and stop everything.
    pub(crate) async fn release_all(&self) {
        let drained: Vec<(u64, Entry)> = self.entries.lock().await.drain().collect();
        for (_, entry) in drained {
            if let Some(reader) = entry.reader {
                reader.shutdown().await;
            }
            metrics::subscription_closed(&BackendLabels::new(self.backend));
        }
    }

    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Handle for one topic listener.
///
/// Closing cancels the background reader, waits for it to finish and then
/// releases the backend's pub/sub handle. Dropping an unclosed subscription
/// schedules the same release on the current runtime.
pub struct Subscription {
    id: u64,
    topic: String,
    backend: Backend,
    table: Arc<SubscriptionTable>,
    closed: AtomicBool,
}

impl Subscription {
    /// The subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The backend serving this subscription.
    #[must_use]
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the subscription. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.table.release(self.id).await;
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("backend", &self.backend)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let table = Arc::clone(&self.table);
            let id = self.id;
            runtime.spawn(async move { table.release(id).await });
        }
    }
}
