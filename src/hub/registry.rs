use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::state::PgPool;
use crate::storage::ObjectStorage;

use super::Hub;

/// Process-global map of active hubs. The lock is only held for lookup,
/// insert and eviction; never while a hub is doing work.
pub struct HubRegistry {
    pool: PgPool,
    config: Arc<AppConfig>,
    storage: Option<Arc<dyn ObjectStorage>>,
    hubs: RwLock<HashMap<Uuid, Arc<Hub>>>,
}

impl HubRegistry {
    pub fn new(
        pool: PgPool,
        config: Arc<AppConfig>,
        storage: Option<Arc<dyn ObjectStorage>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            config,
            storage,
            hubs: RwLock::new(HashMap::new()),
        })
    }

    pub async fn get_or_create(&self, document_id: Uuid) -> Arc<Hub> {
        {
            let hubs = self.hubs.read().await;
            if let Some(hub) = hubs.get(&document_id) {
                if !hub.is_closed() {
                    return Arc::clone(hub);
                }
            }
        }

        let mut hubs = self.hubs.write().await;
        match hubs.get(&document_id) {
            Some(hub) if !hub.is_closed() => Arc::clone(hub),
            _ => {
                let hub = Hub::new(
                    document_id,
                    self.pool.clone(),
                    Arc::clone(&self.config),
                    self.storage.clone(),
                );
                hubs.insert(document_id, Arc::clone(&hub));
                hub
            }
        }
    }

    pub async fn get(&self, document_id: Uuid) -> Option<Arc<Hub>> {
        let hubs = self.hubs.read().await;
        hubs.get(&document_id)
            .filter(|hub| !hub.is_closed())
            .map(Arc::clone)
    }

    pub async fn active_documents(&self) -> usize {
        self.hubs.read().await.len()
    }

    /// Evicts hubs whose peer set has been empty for longer than the idle
    /// window. Correctness-neutral: state is reconstructable from the log.
    pub async fn evict_idle(&self) {
        let window = Duration::from_millis(self.config.hub_idle_evict_ms);
        let mut hubs = self.hubs.write().await;
        let before = hubs.len();
        hubs.retain(|document_id, hub| {
            let idle_long_enough = hub.idle_for().map(|idle| idle >= window).unwrap_or(false);
            if idle_long_enough && hub.close_if_empty() {
                info!(%document_id, "evicting idle document hub");
                false
            } else {
                true
            }
        });
        let evicted = before - hubs.len();
        if evicted > 0 {
            info!(evicted, "hub eviction pass complete");
        }
    }

    /// Background loop driving eviction; exits when the shutdown signal
    /// resolves.
    pub async fn run_eviction(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.hub_idle_evict_ms.max(1_000) / 2);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => self.evict_idle().await,
                _ = shutdown.changed() => break,
            }
        }
    }
}
