//! The shared memory store base.
//!
//! Owns the id→item map for one subsystem, enforces capacity, answers
//! indexed queries, and writes through the persistence layer when one is
//! configured. Persistence writes are awaited by `store`/`update`/`delete`;
//! queries never touch the disk.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::debug;

use marduk_core::error::{Error, Result};

use crate::index::FieldIndex;
use crate::item::{ItemPatch, MemoryItem, Subsystem};
use crate::persist::{FilePersistence, PersistenceConfig};
use crate::query::{MemoryQuery, QueryResponse};
use crate::snapshot::SnapshotStore;

/// Per-store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Item count at which eviction runs before the next insert.
    pub capacity: usize,
    /// Metadata fields indexed in addition to `type`.
    pub index_fields: Vec<String>,
    /// Persistence root; `None` keeps the store memory-only.
    pub persistence: Option<PersistenceConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            index_fields: vec!["tags".to_string(), "category".to_string(), "source".to_string()],
            persistence: None,
        }
    }
}

/// One subsystem's capacity-bound, indexed item store.
pub struct MemoryStore {
    subsystem: Subsystem,
    items: BTreeMap<String, MemoryItem>,
    index: FieldIndex,
    index_fields: Vec<String>,
    capacity: usize,
    access_clock: i64,
    persistence: Option<FilePersistence>,
    snapshots: Option<SnapshotStore>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(subsystem: Subsystem, config: StoreConfig) -> Self {
        let persistence = config
            .persistence
            .map(|p| FilePersistence::new(subsystem, p));
        let snapshots = persistence.clone().map(SnapshotStore::new);
        Self {
            subsystem,
            items: BTreeMap::new(),
            index: FieldIndex::new(&config.index_fields),
            index_fields: config.index_fields,
            capacity: config.capacity.max(1),
            access_clock: 0,
            persistence,
            snapshots,
        }
    }

    /// Create a store and load its persisted items.
    pub async fn open(subsystem: Subsystem, config: StoreConfig) -> Self {
        let mut store = Self::new(subsystem, config);
        if let Some(persistence) = store.persistence.clone() {
            let items = persistence.load_items().await;
            debug!(%subsystem, count = items.len(), "loaded persisted items");
            for item in items {
                store.insert_unchecked(item);
            }
        }
        store
    }

    #[must_use]
    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&MemoryItem> {
        self.items.get(id)
    }

    /// Monotonic access stamp in epoch milliseconds.
    fn next_stamp(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.access_clock = now.max(self.access_clock + 1);
        self.access_clock
    }

    fn insert_unchecked(&mut self, item: MemoryItem) {
        if let Some(previous) = self.items.get(&item.id) {
            self.index.remove(previous);
        }
        self.access_clock = self
            .access_clock
            .max(item.metadata.last_accessed.unwrap_or(0));
        self.index.insert(&item);
        self.items.insert(item.id.clone(), item);
    }

    /// Validate and insert an item, evicting when at capacity.
    pub async fn store(&mut self, mut item: MemoryItem) -> Result<()> {
        item.validate(self.subsystem)?;

        if !self.items.contains_key(&item.id) && self.items.len() >= self.capacity {
            self.evict_oldest();
        }

        item.metadata.last_accessed = Some(self.next_stamp());
        self.insert_unchecked(item);
        self.save().await
    }

    /// Shallow-merge a patch over an existing item. Missing ids are a no-op.
    pub async fn update(&mut self, id: &str, patch: ItemPatch) -> Result<()> {
        let Some(existing) = self.items.get(id) else {
            return Ok(());
        };

        let mut updated = existing.clone();
        if let Some(item_type) = patch.item_type {
            updated.item_type = item_type;
        }
        if let Some(content) = patch.content {
            updated.content = content;
        }
        if let Some(metadata) = patch.metadata {
            merge_metadata(&mut updated.metadata, metadata);
        }
        updated.validate(self.subsystem)?;
        updated.metadata.last_accessed = Some(self.next_stamp());

        self.insert_unchecked(updated);
        self.save().await
    }

    /// Remove an item. Returns whether it existed.
    pub async fn delete(&mut self, id: &str) -> Result<bool> {
        let Some(item) = self.items.remove(id) else {
            return Ok(false);
        };
        self.index.remove(&item);
        self.save().await?;
        Ok(true)
    }

    /// Answer a query: index candidates first, then the subsystem-specific
    /// term and filter predicates. Matched items are touched.
    pub fn query(&mut self, query: &MemoryQuery) -> Result<QueryResponse> {
        query.validate()?;

        let mut lookups: Vec<(&str, &str)> = vec![("type", query.item_type.as_str())];
        if let Some(filters) = &query.filters {
            for (field, filter) in filters {
                if let Some(value) = filter.exact_value() {
                    lookups.push((field.as_str(), value));
                }
            }
        }
        let candidates = self
            .index
            .candidates(&lookups)
            .unwrap_or_else(|| self.items.keys().cloned().collect());

        let mut matched_ids = Vec::new();
        for id in candidates {
            let Some(item) = self.items.get(&id) else {
                continue;
            };
            if item.content.matches_term(&query.term, &item.metadata) && query.filters_match(item) {
                matched_ids.push(id);
            }
        }

        let mut results = Vec::with_capacity(matched_ids.len());
        for id in matched_ids {
            let stamp = self.next_stamp();
            if let Some(item) = self.items.get_mut(&id) {
                item.metadata.last_accessed = Some(stamp);
                results.push(item.clone());
            }
        }
        Ok(QueryResponse::new(results))
    }

    /// Evict the oldest 10 % of items by access stamp; missing stamps are
    /// treated as 0 and go first, ties break on id ascending.
    fn evict_oldest(&mut self) {
        let count = (self.items.len() / 10).max(1);
        let mut ranked: Vec<(i64, String)> = self
            .items
            .values()
            .map(|item| (item.metadata.last_accessed.unwrap_or(0), item.id.clone()))
            .collect();
        ranked.sort();

        for (_, id) in ranked.into_iter().take(count) {
            if let Some(item) = self.items.remove(&id) {
                self.index.remove(&item);
            }
        }
        debug!(subsystem = %self.subsystem, evicted = count, "capacity cleanup");
    }

    /// All items in id order. Used by snapshots and the factory shutdown.
    #[must_use]
    pub fn items(&self) -> Vec<MemoryItem> {
        self.items.values().cloned().collect()
    }

    /// Write the current collection through the persistence layer.
    pub async fn persist(&self) -> Result<()> {
        self.save().await
    }

    async fn save(&self) -> Result<()> {
        if let Some(persistence) = &self.persistence {
            let items = self.items();
            persistence.save_items(&items).await?;
        }
        Ok(())
    }

    /// Write a snapshot of the current collection.
    pub async fn create_snapshot(&self) -> Result<String> {
        let snapshots = self
            .snapshots
            .as_ref()
            .ok_or_else(|| Error::Persistence("snapshots require persistence".to_string()))?;
        snapshots.create(&self.items()).await
    }

    /// Snapshot timestamps, newest first.
    pub async fn list_snapshots(&self) -> Vec<String> {
        match &self.snapshots {
            Some(snapshots) => snapshots.list().await,
            None => Vec::new(),
        }
    }

    /// Replace the in-memory collection with a snapshot's contents.
    /// Returns the number of restored items.
    pub async fn restore_snapshot(&mut self, slug: &str) -> Result<usize> {
        let snapshots = self
            .snapshots
            .as_ref()
            .ok_or_else(|| Error::Persistence("snapshots require persistence".to_string()))?;
        let items = snapshots.load(slug).await?;

        self.items.clear();
        self.index = FieldIndex::new(&self.index_fields);
        for item in &items {
            self.insert_unchecked(item.clone());
        }
        self.save().await?;
        Ok(items.len())
    }
}

fn merge_metadata(base: &mut crate::item::ItemMetadata, patch: crate::item::ItemMetadata) {
    if patch.last_accessed.is_some() {
        base.last_accessed = patch.last_accessed;
    }
    if !patch.tags.is_empty() {
        base.tags = patch.tags;
    }
    if patch.confidence.is_some() {
        base.confidence = patch.confidence;
    }
    if patch.timestamp.is_some() {
        base.timestamp = patch.timestamp;
    }
    if !patch.category.is_empty() {
        base.category = patch.category;
    }
    if patch.source.is_some() {
        base.source = patch.source;
    }
    if patch.importance.is_some() {
        base.importance = patch.importance;
    }
    if patch.emotional_valence.is_some() {
        base.emotional_valence = patch.emotional_valence;
    }
    if patch.success_rate.is_some() {
        base.success_rate = patch.success_rate;
    }
    if patch.complexity.is_some() {
        base.complexity = patch.complexity;
    }
    for (key, value) in patch.extra {
        base.extra.insert(key, value);
    }
}
