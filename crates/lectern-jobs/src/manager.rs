//! Named worker pools over one store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

use lectern_core::{Error, Result};
use lectern_db::Database;

use crate::registry::ExtractorRegistry;
use crate::worker::{ExtractionWorker, WorkerConfig};

/// Registry of named extraction pools sharing a store and extractor set.
pub struct WorkerManager {
    db: Database,
    registry: Arc<ExtractorRegistry>,
    pools: RwLock<BTreeMap<String, ExtractionWorker>>,
}

impl WorkerManager {
    pub fn new(db: Database, registry: Arc<ExtractorRegistry>) -> Self {
        Self {
            db,
            registry,
            pools: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a stopped pool. The pool name overrides `config.pool_name`.
    pub async fn create_pool(&self, name: &str, config: WorkerConfig) -> Result<ExtractionWorker> {
        let mut pools = self.pools.write().await;
        if pools.contains_key(name) {
            return Err(Error::InvalidInput(format!(
                "worker pool already exists: {}",
                name
            )));
        }

        let worker = ExtractionWorker::new(
            self.db.clone(),
            self.registry.clone(),
            config.with_pool_name(name),
        );
        pools.insert(name.to_string(), worker.clone());
        info!(subsystem = "jobs", pool = name, "Worker pool created");
        Ok(worker)
    }

    pub async fn get(&self, name: &str) -> Option<ExtractionWorker> {
        self.pools.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }

    /// Start every pool. Stops at the first pool that fails to start.
    pub async fn start_all(&self) -> Result<()> {
        let pools: Vec<ExtractionWorker> = self.pools.read().await.values().cloned().collect();
        for pool in pools {
            pool.start().await?;
        }
        Ok(())
    }

    /// Stop every pool, returning whether each stopped within `timeout`.
    pub async fn stop_all(&self, timeout: Duration) -> BTreeMap<String, bool> {
        let pools: Vec<(String, ExtractionWorker)> = self
            .pools
            .read()
            .await
            .iter()
            .map(|(name, pool)| (name.clone(), pool.clone()))
            .collect();

        let stops = pools.into_iter().map(|(name, pool)| async move {
            let stopped = pool.stop(timeout).await;
            (name, stopped)
        });
        futures::future::join_all(stops).await.into_iter().collect()
    }

    /// Stop and forget a pool. Returns `None` if no pool has that name.
    pub async fn remove(&self, name: &str, timeout: Duration) -> Option<bool> {
        let pool = self.pools.write().await.remove(name)?;
        let stopped = pool.stop(timeout).await;
        info!(subsystem = "jobs", pool = name, stopped, "Worker pool removed");
        Some(stopped)
    }
}
