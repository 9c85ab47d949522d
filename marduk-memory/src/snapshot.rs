//! Timestamped point-in-time copies of a persisted store.
//!
//! A snapshot is immutable once written. Retention keeps the newest N and
//! deletes the rest; listings are newest-first. Restores verify the checksum
//! sidecar and silently skip items that fail validation.

use chrono::Utc;
use tokio::fs;
use tracing::{debug, warn};

use marduk_core::error::{Error, Result};

use crate::item::MemoryItem;
use crate::persist::{parse_items, sidecar_path, timestamp_slug, FilePersistence};

/// Default number of snapshots retained per subsystem.
pub const DEFAULT_RETENTION: usize = 10;

/// Snapshot manager for one subsystem's store.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    persistence: FilePersistence,
    retention: usize,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(persistence: FilePersistence) -> Self {
        Self {
            persistence,
            retention: DEFAULT_RETENTION,
        }
    }

    #[must_use]
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    /// Write a snapshot of the given items and prune beyond retention.
    /// Returns the snapshot timestamp slug.
    pub async fn create(&self, items: &[MemoryItem]) -> Result<String> {
        let dir = self.persistence.snapshots_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Persistence(format!("create {}: {e}", dir.display())))?;

        let slug = timestamp_slug(Utc::now());
        let path = dir.join(format!("snapshot-{slug}.json"));
        let bytes = serde_json::to_vec_pretty(items)?;
        self.persistence.write_atomic(&path, &bytes).await?;
        debug!(
            subsystem = %self.persistence.subsystem(),
            snapshot = %slug,
            items = items.len(),
            "snapshot created"
        );

        self.prune().await;
        Ok(slug)
    }

    /// Snapshot timestamps, newest first.
    pub async fn list(&self) -> Vec<String> {
        let dir = self.persistence.snapshots_dir();
        let mut slugs = Vec::new();
        let Ok(mut entries) = fs::read_dir(&dir).await else {
            return slugs;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(slug) = name
                .strip_prefix("snapshot-")
                .and_then(|rest| rest.strip_suffix(".json"))
            {
                slugs.push(slug.to_string());
            }
        }
        // The slug format sorts lexicographically in time order.
        slugs.sort();
        slugs.reverse();
        slugs
    }

    /// Load a snapshot after checksum verification, skipping invalid items.
    pub async fn load(&self, slug: &str) -> Result<Vec<MemoryItem>> {
        let path = self
            .persistence
            .snapshots_dir()
            .join(format!("snapshot-{slug}.json"));
        match self.persistence.read_verified(&path).await? {
            Some(bytes) => Ok(parse_items(&bytes, self.persistence.subsystem())),
            None => Err(Error::Persistence(format!("snapshot {slug} not found"))),
        }
    }

    async fn prune(&self) {
        let slugs = self.list().await;
        if slugs.len() <= self.retention {
            return;
        }
        let dir = self.persistence.snapshots_dir();
        for slug in &slugs[self.retention..] {
            let path = dir.join(format!("snapshot-{slug}.json"));
            if let Err(err) = fs::remove_file(&path).await {
                warn!(snapshot = %slug, %err, "failed to prune snapshot");
            }
            let _ = fs::remove_file(sidecar_path(&path)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{MemoryContent, MemoryItem, Subsystem};
    use crate::persist::PersistenceConfig;
    use tempfile::TempDir;

    fn fact(id: &str) -> MemoryItem {
        let mut item = MemoryItem::new(id, "fact", MemoryContent::Fact { text: id.into() });
        item.metadata.confidence = Some(0.9);
        item
    }

    fn snapshots(dir: &TempDir) -> SnapshotStore {
        SnapshotStore::new(FilePersistence::new(
            Subsystem::Factual,
            PersistenceConfig::new(dir.path()),
        ))
    }

    #[tokio::test]
    async fn test_create_list_load() {
        let dir = TempDir::new().unwrap();
        let store = snapshots(&dir);

        let slug = store.create(&[fact("a"), fact("b")]).await.unwrap();
        let listed = store.list().await;
        assert_eq!(listed, vec![slug.clone()]);

        let loaded = store.load(&slug).await.unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn test_retention_prunes_oldest() {
        let dir = TempDir::new().unwrap();
        let store = snapshots(&dir).with_retention(2);

        for i in 0..4 {
            store.create(&[fact(&format!("item-{i}"))]).await.unwrap();
            // Millisecond timestamps need a nudge to stay distinct.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let listed = store.list().await;
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = snapshots(&dir);

        let first = store.create(&[fact("a")]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.create(&[fact("b")]).await.unwrap();

        assert_eq!(store.list().await, vec![second, first]);
    }

    #[tokio::test]
    async fn test_load_missing_snapshot_errors() {
        let dir = TempDir::new().unwrap();
        let store = snapshots(&dir);
        assert!(store.load("2026-01-01T00-00-00-000Z").await.is_err());
    }
}
