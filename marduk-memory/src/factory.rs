//! Composition root for the four memory subsystems.
//!
//! The factory owns every store; components hold the factory by reference
//! and never reach a store except through [`MemoryFactory::store`]. Lifecycle
//! is explicit: `init` loads persisted state, `shutdown` flushes it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use marduk_core::error::Result;

use crate::item::Subsystem;
use crate::persist::PersistenceConfig;
use crate::store::{MemoryStore, StoreConfig};

/// Owner of the four subsystem stores.
pub struct MemoryFactory {
    stores: HashMap<Subsystem, Arc<RwLock<MemoryStore>>>,
}

impl MemoryFactory {
    /// Build the factory with memory-only stores.
    #[must_use]
    pub fn new() -> Self {
        let mut stores = HashMap::new();
        for subsystem in Self::subsystems() {
            stores.insert(
                subsystem,
                Arc::new(RwLock::new(MemoryStore::new(subsystem, StoreConfig::default()))),
            );
        }
        Self { stores }
    }

    /// Build the factory with persistence enabled, loading prior state.
    pub async fn init(persistence: PersistenceConfig, capacity: usize) -> Result<Self> {
        let mut stores = HashMap::new();
        for subsystem in Self::subsystems() {
            let config = StoreConfig {
                capacity,
                persistence: Some(persistence.clone()),
                ..Default::default()
            };
            let store = MemoryStore::open(subsystem, config).await;
            info!(%subsystem, items = store.len(), "memory subsystem ready");
            stores.insert(subsystem, Arc::new(RwLock::new(store)));
        }
        Ok(Self { stores })
    }

    #[must_use]
    pub fn subsystems() -> [Subsystem; 4] {
        [
            Subsystem::Factual,
            Subsystem::Event,
            Subsystem::Concept,
            Subsystem::Workflow,
        ]
    }

    /// Handle to one subsystem's store.
    ///
    /// # Panics
    ///
    /// Never panics: every subsystem is registered at construction.
    #[must_use]
    pub fn store(&self, subsystem: Subsystem) -> Arc<RwLock<MemoryStore>> {
        Arc::clone(
            self.stores
                .get(&subsystem)
                .expect("all subsystems are registered at construction"),
        )
    }

    /// Persist every store. Failures are logged per subsystem and the first
    /// error is surfaced after all stores were attempted.
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        for (subsystem, store) in &self.stores {
            let store = store.read().await;
            if let Err(err) = store.persist().await {
                warn!(%subsystem, %err, "failed to persist store during shutdown");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for MemoryFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{MemoryContent, MemoryItem};
    use crate::query::MemoryQuery;
    use tempfile::TempDir;

    fn fact(id: &str) -> MemoryItem {
        let mut item = MemoryItem::new(id, "fact", MemoryContent::Fact { text: id.into() });
        item.metadata.confidence = Some(0.9);
        item
    }

    #[tokio::test]
    async fn test_each_subsystem_has_its_own_store() {
        let factory = MemoryFactory::new();
        {
            let mut factual = factory.store(Subsystem::Factual).write_owned().await;
            factual.store(fact("a")).await.unwrap();
        }
        let event = factory.store(Subsystem::Event);
        assert!(event.read().await.is_empty());
        let factual = factory.store(Subsystem::Factual);
        assert_eq!(factual.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_init_and_shutdown_round_trip() {
        let dir = TempDir::new().unwrap();
        let persistence = PersistenceConfig::new(dir.path());

        {
            let factory = MemoryFactory::init(persistence.clone(), 100).await.unwrap();
            let store = factory.store(Subsystem::Factual);
            store.write().await.store(fact("kept")).await.unwrap();
            factory.shutdown().await.unwrap();
        }

        let factory = MemoryFactory::init(persistence, 100).await.unwrap();
        let store = factory.store(Subsystem::Factual);
        let response = store
            .write()
            .await
            .query(&MemoryQuery::new("fact", "kept"))
            .unwrap();
        assert_eq!(response.items.len(), 1);
    }
}
