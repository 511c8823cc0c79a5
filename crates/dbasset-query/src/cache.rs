use crate::error::Result;
use crate::registry::ConnectionInfo;
use crate::traits::Connector;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct CachedConnector {
    info: ConnectionInfo,
    connector: Arc<dyn Connector>,
}

/// Size-bounded cache of connector instances keyed by logical source id
///
/// When a new entry would exceed the bound, every entry is dropped. An entry
/// built from different connection info is rebuilt. Dropped connectors are
/// not closed: requests still holding one finish normally and the connector
/// goes away with its last holder. The lock is never held while a connector
/// is built or closed.
pub struct ConnectorCache {
    max_entries: usize,
    entries: Mutex<HashMap<String, CachedConnector>>,
}

impl ConnectorCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached connector for `logical_id`, building it with `build`
    /// when missing or stale
    ///
    /// When two builds for the same source race, the first one inserted wins
    /// and the other connector is discarded.
    pub async fn get_or_build<F, Fut>(
        &self,
        logical_id: &str,
        info: &ConnectionInfo,
        build: F,
    ) -> Result<Arc<dyn Connector>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn Connector>>>,
    {
        if let Some(connector) = self.lookup(logical_id, info).await {
            debug!("Reusing connector for {}", logical_id);
            return Ok(connector);
        }

        let built = build().await?;

        let mut evicted = Vec::new();
        let connector = {
            let mut entries = self.entries.lock().await;
            match entries.get(logical_id) {
                Some(cached) if cached.info == *info => {
                    debug!("Keeping concurrently built connector for {}", logical_id);
                    evicted.push(built);
                    cached.connector.clone()
                }
                _ => {
                    if let Some(stale) = entries.remove(logical_id) {
                        debug!("Connection info changed for {}, replacing", logical_id);
                        evicted.push(stale.connector);
                    }
                    if entries.len() >= self.max_entries {
                        debug!(
                            "Connector cache full ({} entries), clearing",
                            entries.len()
                        );
                        evicted.extend(entries.drain().map(|(_, cached)| cached.connector));
                    }
                    entries.insert(
                        logical_id.to_string(),
                        CachedConnector {
                            info: info.clone(),
                            connector: built.clone(),
                        },
                    );
                    built
                }
            }
        };
        drop(evicted);
        Ok(connector)
    }

    async fn lookup(&self, logical_id: &str, info: &ConnectionInfo) -> Option<Arc<dyn Connector>> {
        self.entries
            .lock()
            .await
            .get(logical_id)
            .filter(|cached| cached.info == *info)
            .map(|cached| cached.connector.clone())
    }

    /// Drop the entry for `logical_id`; returns whether one existed
    pub async fn invalidate(&self, logical_id: &str) -> bool {
        let removed = self.entries.lock().await.remove(logical_id);
        removed.is_some()
    }

    /// Close every cached connector, cancelling their running statements
    pub async fn clear(&self) {
        let drained: Vec<(String, CachedConnector)> = self.entries.lock().await.drain().collect();
        for (id, cached) in drained {
            if let Err(e) = cached.connector.close().await {
                warn!("Failed to close connector for {}: {}", id, e);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
