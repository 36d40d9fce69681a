//! Checkpoint persistence and recovery
//!
//! A checkpoint records which parts of a transfer are done so an interrupted
//! transfer resumes without moving those bytes again. Records are keyed by a
//! slot derived from the transfer direction and resource key; the full
//! [`TransferFingerprint`] stored inside decides whether the record may be
//! trusted. A record whose fingerprint differs from the caller's is deleted
//! on load.
//!
//! Persistence is per completed part: a crash loses at most the parts that
//! were in flight.

use crate::error::{Result, TransferError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::sync::Mutex;

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local payload to the service
    Upload,
    /// Service object to a local file
    Download,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

/// Stable identity of a transfer
///
/// Two transfers with equal fingerprints are resumable against each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferFingerprint {
    /// Upload or download
    pub direction: Direction,

    /// Resource identity, e.g. `bucket/key` plus the local path
    pub resource_key: String,

    /// Payload length, `None` when unknown
    pub total_size: Option<u64>,

    /// Modification marker of the source (mtime or etag)
    pub modification_marker: String,
}

impl TransferFingerprint {
    /// Create a fingerprint
    pub fn new(
        direction: Direction,
        resource_key: impl Into<String>,
        total_size: Option<u64>,
        modification_marker: impl Into<String>,
    ) -> Self {
        Self {
            direction,
            resource_key: resource_key.into(),
            total_size,
            modification_marker: modification_marker.into(),
        }
    }

    /// Storage slot of this transfer
    ///
    /// Derived from direction and resource key only, so a changed size or
    /// marker maps to the same slot and is detected as stale.
    pub fn slot(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.direction.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.resource_key.as_bytes());
        hex::encode(hasher.finalize().as_bytes())
    }

    /// Short slot prefix for log lines
    pub fn short_id(&self) -> String {
        let mut slot = self.slot();
        slot.truncate(16);
        slot
    }
}

/// Completion record of one part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    /// Per-part integrity token returned by the service (uploads)
    pub etag: Option<String>,

    /// CRC-64 of the part contents
    pub crc64: Option<u64>,

    /// Part length in bytes
    pub size: u64,
}

/// Durable record of completed parts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Transfer identity
    pub fingerprint: TransferFingerprint,

    /// Part size the parts were planned with
    pub part_size: u64,

    /// Multipart upload id (uploads)
    pub upload_id: Option<String>,

    /// Staging file (downloads)
    pub staging_path: Option<PathBuf>,

    /// Done parts by index
    pub completed_parts: BTreeMap<u32, PartRecord>,

    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,

    /// Last update timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl Checkpoint {
    /// Create an empty checkpoint
    pub fn new(fingerprint: TransferFingerprint, part_size: u64) -> Self {
        let now = unix_now();
        Self {
            fingerprint,
            part_size,
            upload_id: None,
            staging_path: None,
            completed_parts: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the multipart upload id
    pub fn with_upload_id(mut self, upload_id: impl Into<String>) -> Self {
        self.upload_id = Some(upload_id.into());
        self
    }

    /// Set the staging file
    pub fn with_staging_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.staging_path = Some(path.into());
        self
    }

    /// Mark a part done
    pub fn mark_part_done(&mut self, index: u32, record: PartRecord) {
        self.completed_parts.insert(index, record);
        self.updated_at = unix_now();
    }

    /// Check if a part is done
    pub fn is_part_done(&self, index: u32) -> bool {
        self.completed_parts.contains_key(&index)
    }

    /// Bytes covered by done parts
    pub fn completed_bytes(&self) -> u64 {
        self.completed_parts.values().map(|r| r.size).sum()
    }

    fn is_older_than(&self, max_age: Duration, now: u64) -> bool {
        now.saturating_sub(self.updated_at) > max_age.as_secs()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn no_active_checkpoint() -> TransferError {
    TransferError::checkpoint("no active checkpoint for transfer")
}

/// Storage for checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for `fingerprint`, deleting a stale one
    async fn load(&self, fingerprint: &TransferFingerprint) -> Result<Option<Checkpoint>>;

    /// Store a fresh checkpoint, replacing anything in its slot
    async fn begin(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Record one completed part
    async fn record_part_done(
        &self,
        fingerprint: &TransferFingerprint,
        index: u32,
        record: PartRecord,
    ) -> Result<()>;

    /// Clear the record after a successful transfer
    async fn finalize(&self, fingerprint: &TransferFingerprint) -> Result<()>;

    /// Discard the record so the transfer restarts from zero
    async fn invalidate(&self, fingerprint: &TransferFingerprint) -> Result<()>;

    /// All stored checkpoints
    async fn list(&self) -> Result<Vec<Checkpoint>>;

    /// Remove checkpoints not updated within `max_age`; returns the number removed
    async fn cleanup_older_than(&self, max_age: Duration) -> Result<usize>;
}

/// In-process checkpoint store
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<String, Checkpoint>,
}

impl MemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, fingerprint: &TransferFingerprint) -> Result<Option<Checkpoint>> {
        let slot = fingerprint.slot();
        let stored = self.checkpoints.get(&slot).map(|c| c.clone());
        match stored {
            Some(checkpoint) if checkpoint.fingerprint == *fingerprint => Ok(Some(checkpoint)),
            Some(_) => {
                tracing::debug!("Discarding stale checkpoint {}", fingerprint.short_id());
                self.checkpoints.remove(&slot);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn begin(&self, checkpoint: Checkpoint) -> Result<()> {
        self.checkpoints
            .insert(checkpoint.fingerprint.slot(), checkpoint);
        Ok(())
    }

    async fn record_part_done(
        &self,
        fingerprint: &TransferFingerprint,
        index: u32,
        record: PartRecord,
    ) -> Result<()> {
        let mut entry = self
            .checkpoints
            .get_mut(&fingerprint.slot())
            .filter(|c| c.fingerprint == *fingerprint)
            .ok_or_else(no_active_checkpoint)?;
        entry.mark_part_done(index, record);
        Ok(())
    }

    async fn finalize(&self, fingerprint: &TransferFingerprint) -> Result<()> {
        self.checkpoints.remove(&fingerprint.slot());
        Ok(())
    }

    async fn invalidate(&self, fingerprint: &TransferFingerprint) -> Result<()> {
        self.checkpoints.remove(&fingerprint.slot());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.checkpoints.iter().map(|e| e.value().clone()).collect())
    }

    async fn cleanup_older_than(&self, max_age: Duration) -> Result<usize> {
        let now = unix_now();
        let before = self.checkpoints.len();
        self.checkpoints
            .retain(|_, checkpoint| !checkpoint.is_older_than(max_age, now));
        Ok(before - self.checkpoints.len())
    }
}

/// Checkpoint store backed by one JSON file per slot
///
/// Files are replaced atomically (temp file + rename). Writes to one slot are
/// serialized by a per-slot async mutex, so parts of the same transfer can
/// complete concurrently without losing updates.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    cache: DashMap<String, Checkpoint>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileCheckpointStore {
    /// Create a store rooted at `dir` (created on first write)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Checkpoint directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get checkpoint file path for a slot
    fn checkpoint_file_path(&self, slot: &str) -> PathBuf {
        self.dir.join(format!("{slot}.json"))
    }

    fn slot_lock(&self, slot: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(slot.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    async fn read_slot(&self, slot: &str) -> Result<Option<Checkpoint>> {
        if let Some(cached) = self.cache.get(slot) {
            return Ok(Some(cached.clone()));
        }

        let path = self.checkpoint_file_path(slot);
        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<Checkpoint>(&json) {
            Ok(checkpoint) => {
                self.cache.insert(slot.to_string(), checkpoint.clone());
                Ok(Some(checkpoint))
            }
            Err(e) => {
                tracing::warn!("Discarding unreadable checkpoint {}: {}", path.display(), e);
                remove_if_exists(&path).await?;
                Ok(None)
            }
        }
    }

    async fn write_slot(&self, slot: &str, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_string_pretty(checkpoint).map_err(|e| {
            TransferError::Serialization(Cow::Owned(format!("Failed to serialize checkpoint: {e}")))
        })?;

        let path = self.checkpoint_file_path(slot);
        let tmp = self.dir.join(format!("{slot}.json.tmp"));
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;

        self.cache.insert(slot.to_string(), checkpoint.clone());
        Ok(())
    }

    /// Remove a slot; the caller holds its lock
    async fn remove_slot(&self, slot: &str) -> Result<()> {
        self.cache.remove(slot);
        remove_if_exists(&self.checkpoint_file_path(slot)).await
    }

    async fn delete_slot(&self, slot: &str) -> Result<()> {
        let lock = self.slot_lock(slot);
        let result = {
            let _guard = lock.lock().await;
            self.remove_slot(slot).await
        };
        self.release_lock(slot, &lock);
        result
    }

    /// Drop the lock entry of a removed slot unless another task holds a handle
    fn release_lock(&self, slot: &str, lock: &Arc<Mutex<()>>) {
        // One reference in the map and one held by the caller
        self.locks
            .remove_if(slot, |_, entry| Arc::ptr_eq(entry, lock) && Arc::strong_count(entry) <= 2);
    }

    async fn read_all(&self) -> Result<Vec<(String, Checkpoint)>> {
        let mut checkpoints = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(checkpoints),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Some(slot) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };
            if let Ok(json) = fs::read_to_string(&path).await {
                if let Ok(checkpoint) = serde_json::from_str::<Checkpoint>(&json) {
                    checkpoints.push((slot, checkpoint));
                }
            }
        }

        Ok(checkpoints)
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, fingerprint: &TransferFingerprint) -> Result<Option<Checkpoint>> {
        let slot = fingerprint.slot();
        let lock = self.slot_lock(&slot);
        let loaded = {
            let _guard = lock.lock().await;
            match self.read_slot(&slot).await? {
                Some(checkpoint) if checkpoint.fingerprint == *fingerprint => {
                    tracing::debug!(
                        "Loaded checkpoint {} with {} completed parts",
                        fingerprint.short_id(),
                        checkpoint.completed_parts.len()
                    );
                    Some(checkpoint)
                }
                Some(_) => {
                    // Removed under the same guard as the read, so a concurrent
                    // `begin` for this slot cannot be lost
                    tracing::debug!("Discarding stale checkpoint {}", fingerprint.short_id());
                    self.remove_slot(&slot).await?;
                    None
                }
                None => None,
            }
        };

        if loaded.is_none() {
            self.release_lock(&slot, &lock);
        }
        Ok(loaded)
    }

    async fn begin(&self, checkpoint: Checkpoint) -> Result<()> {
        let slot = checkpoint.fingerprint.slot();
        let lock = self.slot_lock(&slot);
        let _guard = lock.lock().await;
        self.write_slot(&slot, &checkpoint).await
    }

    async fn record_part_done(
        &self,
        fingerprint: &TransferFingerprint,
        index: u32,
        record: PartRecord,
    ) -> Result<()> {
        let slot = fingerprint.slot();
        let lock = self.slot_lock(&slot);
        let _guard = lock.lock().await;

        let mut checkpoint = self
            .read_slot(&slot)
            .await?
            .filter(|c| c.fingerprint == *fingerprint)
            .ok_or_else(no_active_checkpoint)?;
        checkpoint.mark_part_done(index, record);
        self.write_slot(&slot, &checkpoint).await
    }

    async fn finalize(&self, fingerprint: &TransferFingerprint) -> Result<()> {
        tracing::debug!("Clearing checkpoint {}", fingerprint.short_id());
        self.delete_slot(&fingerprint.slot()).await
    }

    async fn invalidate(&self, fingerprint: &TransferFingerprint) -> Result<()> {
        tracing::debug!("Invalidating checkpoint {}", fingerprint.short_id());
        self.delete_slot(&fingerprint.slot()).await
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .map(|(_, checkpoint)| checkpoint)
            .collect())
    }

    async fn cleanup_older_than(&self, max_age: Duration) -> Result<usize> {
        let now = unix_now();
        let mut removed = 0;

        for (slot, checkpoint) in self.read_all().await? {
            if checkpoint.is_older_than(max_age, now) {
                self.delete_slot(&slot).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!("Removed {} expired checkpoints", removed);
        }
        Ok(removed)
    }
}
