//! Atomic JSON persistence with checksum sidecars, batch mode, and
//! best-effort backups.
//!
//! Write discipline: serialize to `<file>.tmp`, write the SHA-256 sidecar
//! next to it, rename the data file into place, then promote the sidecar.
//! Rename is atomic on the same filesystem, so readers observe either the
//! old or the new state, never a torn write.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use marduk_core::error::{Error, Result};

use crate::item::{MemoryItem, Subsystem};

/// Filename-safe timestamp: ISO-8601 with `:` and `.` replaced by `-`.
#[must_use]
pub fn timestamp_slug(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

/// Persistence settings shared by every subsystem store.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Root under which each subsystem keeps its directory.
    pub data_dir: PathBuf,
    /// Root for timestamped backups (`_backups/<subsystem>/`).
    pub backup_dir: PathBuf,
    /// Write and verify SHA-256 sidecars.
    pub write_checksums: bool,
    /// Collections above this size are split into batch files.
    pub max_batch_size: usize,
    /// Filesystem ops retry this many times with exponential backoff.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub retry_base_delay: Duration,
}

impl PersistenceConfig {
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let backup_dir = data_dir.join("_backups");
        Self {
            data_dir,
            backup_dir,
            write_checksums: true,
            max_batch_size: 1000,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(50),
        }
    }
}

/// JSON file persistence for one subsystem.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    subsystem: Subsystem,
    config: PersistenceConfig,
}

impl FilePersistence {
    #[must_use]
    pub fn new(subsystem: Subsystem, config: PersistenceConfig) -> Self {
        Self { subsystem, config }
    }

    fn dir(&self) -> PathBuf {
        self.config.data_dir.join(self.subsystem.as_str())
    }

    fn items_path(&self) -> PathBuf {
        self.dir().join("items.json")
    }

    fn batches_dir(&self) -> PathBuf {
        self.dir().join("batches")
    }

    fn backup_dir(&self) -> PathBuf {
        self.config.backup_dir.join(self.subsystem.as_str())
    }

    /// Directory holding this subsystem's snapshots.
    #[must_use]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.dir().join("snapshots")
    }

    /// Persist the full collection, switching to batch mode above
    /// `max_batch_size` items.
    pub async fn save_items(&self, items: &[MemoryItem]) -> Result<()> {
        fs::create_dir_all(self.dir())
            .await
            .map_err(|e| Error::Persistence(format!("create {}: {e}", self.dir().display())))?;

        self.backup_existing().await;

        if items.len() > self.config.max_batch_size {
            self.save_batched(items).await
        } else {
            let bytes = serde_json::to_vec_pretty(items)?;
            self.write_atomic(&self.items_path(), &bytes).await?;
            // A leftover batch directory would shadow the single file on load.
            if fs::try_exists(self.batches_dir()).await.unwrap_or(false) {
                let _ = fs::remove_dir_all(self.batches_dir()).await;
            }
            Ok(())
        }
    }

    async fn save_batched(&self, items: &[MemoryItem]) -> Result<()> {
        let dir = self.batches_dir();
        if fs::try_exists(&dir).await.unwrap_or(false) {
            let _ = fs::remove_dir_all(&dir).await;
        }
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Persistence(format!("create {}: {e}", dir.display())))?;

        let mut batch_names = Vec::new();
        for (index, chunk) in items.chunks(self.config.max_batch_size).enumerate() {
            let name = format!("batch_{index:05}.json");
            let bytes = serde_json::to_vec_pretty(chunk)?;
            self.write_atomic(&dir.join(&name), &bytes).await?;
            batch_names.push(name);
        }

        let index_doc = serde_json::json!({
            "batches": batch_names,
            "total": items.len(),
        });
        self.write_atomic(&dir.join("index.json"), &serde_json::to_vec_pretty(&index_doc)?)
            .await?;

        let _ = fs::remove_file(self.items_path()).await;
        let _ = fs::remove_file(sidecar_path(&self.items_path())).await;
        debug!(
            subsystem = %self.subsystem,
            batches = batch_names.len(),
            "saved collection in batch mode"
        );
        Ok(())
    }

    /// Load the persisted collection.
    ///
    /// I/O failures degrade to an empty collection with a warning; checksum
    /// mismatches fall back to the newest backup before degrading.
    pub async fn load_items(&self) -> Vec<MemoryItem> {
        let batches_index = self.batches_dir().join("index.json");
        if fs::try_exists(&batches_index).await.unwrap_or(false) {
            return self.load_batched(&batches_index).await;
        }

        match self.read_verified(&self.items_path()).await {
            Ok(Some(bytes)) => parse_items(&bytes, self.subsystem),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(subsystem = %self.subsystem, %err, "items file failed verification, trying backup");
                self.load_newest_backup().await
            }
        }
    }

    async fn load_batched(&self, index_path: &Path) -> Vec<MemoryItem> {
        let index_bytes = match self.read_verified(index_path).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(subsystem = %self.subsystem, %err, "batch index failed verification");
                return self.load_newest_backup().await;
            }
        };

        let Ok(index_doc) = serde_json::from_slice::<serde_json::Value>(&index_bytes) else {
            warn!(subsystem = %self.subsystem, "batch index is not valid JSON");
            return Vec::new();
        };
        let names: Vec<String> = index_doc
            .get("batches")
            .and_then(|b| b.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut items = Vec::new();
        for name in names {
            let path = self.batches_dir().join(&name);
            match self.read_verified(&path).await {
                Ok(Some(bytes)) => items.extend(parse_items(&bytes, self.subsystem)),
                Ok(None) => warn!(subsystem = %self.subsystem, batch = %name, "batch file missing"),
                Err(err) => {
                    warn!(subsystem = %self.subsystem, batch = %name, %err, "skipping corrupt batch");
                }
            }
        }
        items
    }

    /// Subsystem this persistence handle serves.
    #[must_use]
    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    /// Read a file and verify its sidecar when present.
    pub(crate) async fn read_verified(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        read_verified_file(path).await
    }

    async fn load_newest_backup(&self) -> Vec<MemoryItem> {
        let dir = self.backup_dir();
        let mut names: Vec<String> = match fs::read_dir(&dir).await {
            Ok(mut entries) => {
                let mut names = Vec::new();
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.ends_with(".bak") {
                        names.push(name);
                    }
                }
                names
            }
            Err(_) => return Vec::new(),
        };
        names.sort();

        for name in names.into_iter().rev() {
            let path = dir.join(&name);
            if let Ok(bytes) = fs::read(&path).await {
                let items = parse_items(&bytes, self.subsystem);
                if !items.is_empty() {
                    warn!(subsystem = %self.subsystem, backup = %name, "recovered from backup");
                    return items;
                }
            }
        }
        Vec::new()
    }

    /// Copy the current items file into the backup directory. Best-effort:
    /// failures are logged, never surfaced.
    async fn backup_existing(&self) {
        let source = self.items_path();
        if !fs::try_exists(&source).await.unwrap_or(false) {
            return;
        }
        let dir = self.backup_dir();
        if let Err(err) = fs::create_dir_all(&dir).await {
            warn!(%err, "backup directory unavailable");
            return;
        }
        let target = dir.join(format!("{}.bak", timestamp_slug(Utc::now())));
        if let Err(err) = fs::copy(&source, &target).await {
            warn!(%err, "backup copy failed");
        }
    }

    /// Write bytes atomically with retries and an optional checksum sidecar.
    pub async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        write_atomic_file(
            path,
            bytes,
            self.config.write_checksums,
            self.config.max_retries,
            self.config.retry_base_delay,
        )
        .await
    }
}

/// Write bytes atomically: tmp file, checksum sidecar, rename, sidecar
/// promotion. Each filesystem op retries with exponential backoff.
pub async fn write_atomic_file(
    path: &Path,
    bytes: &[u8],
    with_checksum: bool,
    max_retries: u32,
    base_delay: Duration,
) -> Result<()> {
    let tmp = tmp_path(path);
    let sidecar = sidecar_path(path);
    let sidecar_tmp = tmp_path(&sidecar);

    retry_io("write", max_retries, base_delay, || fs::write(&tmp, bytes)).await?;
    if with_checksum {
        let digest = checksum(bytes);
        retry_io("write checksum", max_retries, base_delay, || {
            fs::write(&sidecar_tmp, digest.as_bytes())
        })
        .await?;
    }
    retry_io("rename", max_retries, base_delay, || fs::rename(&tmp, path)).await?;
    if with_checksum {
        retry_io("promote checksum", max_retries, base_delay, || {
            fs::rename(&sidecar_tmp, &sidecar)
        })
        .await?;
    }
    Ok(())
}

/// Read a file, verifying its checksum sidecar when one exists.
///
/// Missing files and plain read errors degrade to `None` with a warning;
/// a checksum mismatch is an integrity error the caller must handle.
pub async fn read_verified_file(path: &Path) -> Result<Option<Vec<u8>>> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(None);
    }
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(path = %path.display(), %err, "read failed, degrading to empty");
            return Ok(None);
        }
    };

    let sidecar = sidecar_path(path);
    if fs::try_exists(&sidecar).await.unwrap_or(false) {
        let recorded = fs::read_to_string(&sidecar)
            .await
            .map_err(|e| Error::Persistence(format!("read {}: {e}", sidecar.display())))?;
        if recorded.trim() != checksum(&bytes) {
            return Err(Error::Integrity(format!(
                "checksum mismatch for {}",
                path.display()
            )));
        }
    }
    Ok(Some(bytes))
}

async fn retry_io<F, Fut>(what: &str, max_retries: u32, base_delay: Duration, mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::io::Result<()>>,
{
    let mut delay = base_delay;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                attempt += 1;
                if attempt >= max_retries {
                    return Err(Error::Persistence(format!("{what} failed: {err}")));
                }
                warn!(%err, attempt, "{what} failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Sidecar path for a data file: `<file>.checksum`.
#[must_use]
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".checksum");
    path.with_file_name(name)
}

/// Hex-encoded SHA-256 digest.
#[must_use]
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn parse_items(bytes: &[u8], subsystem: Subsystem) -> Vec<MemoryItem> {
    match serde_json::from_slice::<Vec<MemoryItem>>(bytes) {
        Ok(items) => items
            .into_iter()
            .filter(|item| item.validate(subsystem).is_ok())
            .collect(),
        Err(err) => {
            warn!(%subsystem, %err, "persisted items failed to parse");
            Vec::new()
        }
    }
}
