//! Context-cache persistence with rolling snapshots.
//!
//! The cache file is an array of `[key, entry]` pairs; a metadata file
//! records the last save. Concurrent saves are debounced: when a save is in
//! progress, a new request only refreshes the metadata marker and is
//! dropped. This component exclusively owns the files it writes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};

use marduk_core::error::{Error, Result};
use marduk_memory::persist::{
    read_verified_file, sidecar_path, timestamp_slug, write_atomic_file,
};

use crate::cache::ContextCacheItem;

const CACHE_FILE: &str = "context-cache.json";
const METADATA_FILE: &str = "context-metadata.json";
const SNAPSHOT_PREFIX: &str = "context-snapshot-";

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

/// Persistence for the coordinator's context cache.
pub struct ContextPersistence {
    dir: PathBuf,
    write_checksums: bool,
    retention: usize,
    save_in_progress: AtomicBool,
}

impl ContextPersistence {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_checksums: true,
            retention: 10,
            save_in_progress: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    fn cache_path(&self) -> PathBuf {
        self.dir.join(CACHE_FILE)
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.dir.join("snapshots")
    }

    /// Persist the cache entries. Returns `false` when the request was
    /// debounced because another save is in flight.
    pub async fn save(&self, entries: &[(String, ContextCacheItem)]) -> Result<bool> {
        if self
            .save_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another save owns the files; leave a marker and drop this one.
            self.write_metadata_marker("skipped").await;
            return Ok(false);
        }

        let result = self.save_locked(entries).await;
        self.save_in_progress.store(false, Ordering::Release);
        result.map(|()| true)
    }

    async fn save_locked(&self, entries: &[(String, ContextCacheItem)]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::Persistence(format!("create {}: {e}", self.dir.display())))?;

        let bytes = serde_json::to_vec_pretty(entries)?;
        write_atomic_file(
            &self.cache_path(),
            &bytes,
            self.write_checksums,
            MAX_RETRIES,
            RETRY_BASE_DELAY,
        )
        .await?;

        let metadata = serde_json::json!({
            "savedAt": Utc::now().to_rfc3339(),
            "entryCount": entries.len(),
            "status": "saved",
        });
        write_atomic_file(
            &self.metadata_path(),
            &serde_json::to_vec_pretty(&metadata)?,
            false,
            MAX_RETRIES,
            RETRY_BASE_DELAY,
        )
        .await?;

        debug!(entries = entries.len(), "context cache persisted");
        Ok(())
    }

    async fn write_metadata_marker(&self, status: &str) {
        let metadata = serde_json::json!({
            "markedAt": Utc::now().to_rfc3339(),
            "status": status,
        });
        if let Ok(bytes) = serde_json::to_vec_pretty(&metadata) {
            if fs::create_dir_all(&self.dir).await.is_ok() {
                if let Err(err) =
                    write_atomic_file(&self.metadata_path(), &bytes, false, 1, RETRY_BASE_DELAY)
                        .await
                {
                    warn!(%err, "failed to write save marker");
                }
            }
        }
    }

    /// Load persisted entries, skipping pairs that fail to parse or whose
    /// numeric fields are incoherent.
    pub async fn load(&self) -> Result<Vec<(String, ContextCacheItem)>> {
        let Some(bytes) = read_verified_file(&self.cache_path()).await? else {
            return Ok(Vec::new());
        };
        Ok(parse_entries(&bytes))
    }

    /// Write a rolling snapshot and prune beyond retention.
    pub async fn create_snapshot(
        &self,
        entries: &[(String, ContextCacheItem)],
    ) -> Result<String> {
        let dir = self.snapshots_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Persistence(format!("create {}: {e}", dir.display())))?;

        let slug = timestamp_slug(Utc::now());
        let path = dir.join(format!("{SNAPSHOT_PREFIX}{slug}.json"));
        let bytes = serde_json::to_vec_pretty(entries)?;
        write_atomic_file(&path, &bytes, self.write_checksums, MAX_RETRIES, RETRY_BASE_DELAY)
            .await?;

        self.prune_snapshots().await;
        Ok(slug)
    }

    /// Snapshot timestamps, newest first.
    pub async fn list_snapshots(&self) -> Vec<String> {
        let mut slugs = Vec::new();
        let Ok(mut entries) = fs::read_dir(self.snapshots_dir()).await else {
            return slugs;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(slug) = name
                .strip_prefix(SNAPSHOT_PREFIX)
                .and_then(|rest| rest.strip_suffix(".json"))
            {
                slugs.push(slug.to_string());
            }
        }
        slugs.sort();
        slugs.reverse();
        slugs
    }

    /// Load a snapshot after checksum verification.
    pub async fn load_snapshot(&self, slug: &str) -> Result<Vec<(String, ContextCacheItem)>> {
        let path = self
            .snapshots_dir()
            .join(format!("{SNAPSHOT_PREFIX}{slug}.json"));
        match read_verified_file(&path).await? {
            Some(bytes) => Ok(parse_entries(&bytes)),
            None => Err(Error::Persistence(format!("context snapshot {slug} not found"))),
        }
    }

    async fn prune_snapshots(&self) {
        let slugs = self.list_snapshots().await;
        if slugs.len() <= self.retention {
            return;
        }
        let dir = self.snapshots_dir();
        for slug in &slugs[self.retention..] {
            let path = dir.join(format!("{SNAPSHOT_PREFIX}{slug}.json"));
            if let Err(err) = fs::remove_file(&path).await {
                warn!(snapshot = %slug, %err, "failed to prune context snapshot");
            }
            let _ = fs::remove_file(sidecar_path(&path)).await;
        }
    }
}

fn parse_entries(bytes: &[u8]) -> Vec<(String, ContextCacheItem)> {
    let Ok(raw) = serde_json::from_slice::<Vec<Value>>(bytes) else {
        warn!("context cache file is not a JSON array");
        return Vec::new();
    };

    let mut entries = Vec::with_capacity(raw.len());
    for pair in raw {
        match serde_json::from_value::<(String, ContextCacheItem)>(pair) {
            Ok((key, item)) if item.is_well_formed() => entries.push((key, item)),
            Ok((key, _)) => warn!(%key, "skipping malformed cache entry"),
            Err(err) => warn!(%err, "skipping unparseable cache entry"),
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(relevance: f64) -> ContextCacheItem {
        ContextCacheItem::new(vec!["ctx line".to_string()], relevance)
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let persistence = ContextPersistence::new(dir.path());

        let entries = vec![
            ("query:alpha".to_string(), entry(0.3)),
            ("query:beta".to_string(), entry(0.8)),
        ];
        assert!(persistence.save(&entries).await.unwrap());

        let loaded = persistence.load().await.unwrap();
        assert_eq!(loaded, entries);
    }

    #[tokio::test]
    async fn test_load_skips_malformed_pairs() {
        let dir = TempDir::new().unwrap();
        let persistence = ContextPersistence::new(dir.path());

        let mut bad = entry(0.5);
        bad.access_count = 0;
        let raw = serde_json::json!([
            ["good", entry(0.5)],
            ["bad", bad],
            ["unparseable", {"context": "not an array"}],
        ]);
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(
            dir.path().join(CACHE_FILE),
            serde_json::to_vec(&raw).unwrap(),
        )
        .unwrap();

        let loaded = persistence.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "good");
    }

    #[tokio::test]
    async fn test_missing_cache_is_empty() {
        let dir = TempDir::new().unwrap();
        let persistence = ContextPersistence::new(dir.path());
        assert!(persistence.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_and_retention() {
        let dir = TempDir::new().unwrap();
        let persistence = ContextPersistence::new(dir.path()).with_retention(2);

        let mut last = String::new();
        for i in 0..4 {
            let entries = vec![(format!("query:{i}"), entry(0.5))];
            last = persistence.create_snapshot(&entries).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let slugs = persistence.list_snapshots().await;
        assert_eq!(slugs.len(), 2);
        assert_eq!(slugs[0], last);

        let loaded = persistence.load_snapshot(&last).await.unwrap();
        assert_eq!(loaded[0].0, "query:3");
    }

    #[tokio::test]
    async fn test_metadata_written_on_save() {
        let dir = TempDir::new().unwrap();
        let persistence = ContextPersistence::new(dir.path());
        persistence.save(&[]).await.unwrap();

        let metadata: Value = serde_json::from_slice(
            &std::fs::read(dir.path().join(METADATA_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(metadata["status"], "saved");
        assert_eq!(metadata["entryCount"], 0);
    }
}
