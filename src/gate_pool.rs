use std::collections::HashMap;

use tokio::sync::Mutex;

/// Anything the pool can shut down in an orderly way. Separate from the gate
/// itself so pool behavior is testable without a live transport.
#[async_trait::async_trait]
pub trait Closeable: Send {
    async fn close(self);
}

/// A per-host registry of live handles: at most one per host. The scheduler
/// serializes per host by construction, but evictions arrive from any task,
/// so the map itself is lock-guarded.
pub struct Pool<G> {
    gates: Mutex<HashMap<String, G>>,
}

pub type GatePool = Pool<crate::ssh::Gate>;

impl<G: Closeable> Pool<G> {
    pub fn new() -> Self {
        Pool {
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Remove and return the host's handle. `None` tells the caller to build
    /// a fresh one; the handle comes back through `release`.
    pub async fn acquire(&self, host_name: &str) -> Option<G> {
        self.gates.lock().await.remove(host_name)
    }

    /// Store a handle for a host, closing any entry it displaces.
    pub async fn release(&self, host_name: &str, gate: G) {
        let displaced = self
            .gates
            .lock()
            .await
            .insert(host_name.to_string(), gate);
        if let Some(old) = displaced {
            old.close().await;
        }
    }

    /// Pop an arbitrary entry and close it. Used to relieve connection
    /// pressure before a transport retry.
    pub async fn evict_one(&self) {
        let victim = {
            let mut gates = self.gates.lock().await;
            let key = gates.keys().next().cloned();
            key.and_then(|k| gates.remove(&k).map(|g| (k, g)))
        };
        if let Some((host_name, gate)) = victim {
            gate.close().await;
            tracing::info!(host_name, "closed gate");
        }
    }

    /// Orderly shutdown of every pooled handle.
    pub async fn drain(&self) {
        let drained: Vec<(String, G)> = self.gates.lock().await.drain().collect();
        for (_, gate) in drained {
            gate.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.gates.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.gates.lock().await.is_empty()
    }
}

impl<G: Closeable> Default for Pool<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool<crate::ssh::Gate> {
    /// Borrow the live session of a host's pooled gate without disturbing the
    /// entry, for callers that only need the connection (file operations).
    pub async fn session_for(&self, host_name: &str) -> Option<std::sync::Arc<openssh::Session>> {
        self.gates
            .lock()
            .await
            .get(host_name)
            .map(|gate| gate.session.clone())
    }
}
