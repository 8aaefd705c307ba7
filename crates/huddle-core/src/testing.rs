//! In-memory connections for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::connection::{Connection, ConnectionId, SendError};

pub(crate) struct RecordingConnection {
    id: ConnectionId,
    fail: bool,
    received: Mutex<Vec<Value>>,
}

impl RecordingConnection {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(id),
            fail: false,
            received: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn failing(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(id),
            fail: true,
            received: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Received payloads whose `type` is `kind`.
    pub(crate) fn events(&self, kind: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|v| v["type"] == kind)
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.received.lock().unwrap().clear();
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send(&self, payload: &Value) -> Result<(), SendError> {
        if self.fail {
            return Err(SendError::Closed);
        }
        self.received.lock().unwrap().push(payload.clone());
        Ok(())
    }
}
