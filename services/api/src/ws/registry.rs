//! Live bridges by connection id, owned by the server.

use super::bridge::{CloseReason, DuplexStreamBridge};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Default)]
pub struct ConnectionRegistry {
    bridges: Mutex<HashMap<Uuid, DuplexStreamBridge>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: Uuid, bridge: DuplexStreamBridge) {
        self.bridges.lock().await.insert(id, bridge);
    }

    pub async fn remove(&self, id: &Uuid) -> Option<DuplexStreamBridge> {
        self.bridges.lock().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.bridges.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bridges.lock().await.is_empty()
    }

    /// Closes and forgets every registered bridge.
    pub async fn close_all(&self, reason: CloseReason) {
        // Drain first so the lock is not held while bridges tear down.
        let drained: Vec<_> = self.bridges.lock().await.drain().collect();
        info!(connections = drained.len(), "Closing all connections.");
        for (id, bridge) in drained {
            info!(connection_id = %id, "Closing connection.");
            bridge.close(reason.clone()).await;
        }
    }
}
