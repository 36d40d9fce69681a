//! Downloads
//!
//! Parts are fetched with ranged `GET`s into a staging file next to the
//! destination (`<dest>.temp`) and published with one rename once every part
//! is written and the combined CRC-64 matches the object's. A single-part
//! object is fetched with one un-ranged `GET`.

use super::plan::{Part, TransferPlan};
use super::scheduler::{FinalizeOutcome, PartDriver, PartFeed, PartIo, PartOutcome, PartTask};
use super::{Emitter, Runtime, TransferControl, TransferSummary, retry_transient};
use crate::cancel::CancellationToken;
use crate::checkpoint::{Checkpoint, CheckpointStore, Direction, TransferFingerprint};
use crate::client::{ObjectRequest, RequestExecutor, Signer, Transport};
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::event::PartEvent;
use crate::rate_limiter::RateLimiter;
use async_trait::async_trait;
use futures::StreamExt;
use http::Method;
use http::header::{HeaderValue, IF_MATCH, LAST_MODIFIED, RANGE};
use std::path::PathBuf;
use std::sync::Arc;
use tos_transfer_files::{
    LocalStagingFs, PartChecksum, PartPlanner, PlanningMode, StagingFs, staging_path,
};

/// Download of one object to a local file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Source bucket
    pub bucket: String,
    /// Source key
    pub key: String,
    /// Local destination; written only by the final rename
    pub destination: PathBuf,
}

impl DownloadRequest {
    /// Create a request
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            destination: destination.into(),
        }
    }
}

/// Object metadata from a `HEAD` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object length
    pub size: u64,
    /// Entity tag
    pub etag: Option<String>,
    /// `Last-Modified` header, verbatim
    pub last_modified: Option<String>,
    /// Whole-object CRC-64 reported by the service
    pub crc64: Option<u64>,
}

impl ObjectInfo {
    /// Marker that changes whenever the object is rewritten
    pub fn modification_marker(&self) -> String {
        self.etag
            .clone()
            .or_else(|| self.last_modified.clone())
            .unwrap_or_default()
    }
}

struct DownloadDriver {
    bucket: String,
    key: String,
    info: ObjectInfo,
    mode: PlanningMode,
    executor: Arc<RequestExecutor>,
    staging_fs: Arc<dyn StagingFs>,
    staging: PathBuf,
    destination: PathBuf,
    store: Option<Arc<dyn CheckpointStore>>,
    fingerprint: TransferFingerprint,
    part_size: u64,
    enable_crc: bool,
    resumed: bool,
    emitter: Emitter,
}

impl DownloadDriver {
    fn request_for(&self, task: &PartTask) -> Result<ObjectRequest> {
        let mut request = ObjectRequest::new(Method::GET, &self.bucket, &self.key);
        if self.mode == PlanningMode::Multipart {
            let range = HeaderValue::from_str(&task.range.to_header())
                .map_err(|_| TransferError::planning("unrepresentable range header"))?;
            request = request.with_header(RANGE, range);
        }
        if let Some(etag) = &self.info.etag {
            // A rewritten object must not be stitched into this download
            if let Ok(value) = HeaderValue::from_str(etag) {
                request = request.with_header(IF_MATCH, value);
            }
        }
        Ok(request)
    }
}

#[async_trait]
impl PartDriver for DownloadDriver {
    async fn prepare(&self, _plan: &TransferPlan) -> Result<()> {
        if self.resumed {
            tracing::debug!(
                "Resuming download into existing staging file {}",
                self.staging.display()
            );
            return Ok(());
        }

        if let Err(e) = self.staging_fs.create(&self.staging, self.info.size).await {
            let error = TransferError::from(e);
            self.emitter.part(PartEvent::CreateTempFileFailed {
                error: error.clone(),
            });
            return Err(error);
        }
        self.emitter.part(PartEvent::TempFileCreated {
            path: self.staging.clone(),
        });

        if let Some(store) = &self.store {
            let checkpoint = Checkpoint::new(self.fingerprint.clone(), self.part_size)
                .with_staging_path(self.staging.clone());
            store.begin(checkpoint).await?;
        }
        Ok(())
    }

    async fn transfer_part(&self, task: PartTask, io: PartIo) -> Result<PartOutcome> {
        if io.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let request = self.request_for(&task)?;
        let response = self.executor.execute(request).await?;

        let expected_len = task.range.len();
        if let Some(len) = response.content_length() {
            if len != expected_len {
                return Err(TransferError::transient("response length differs from part"));
            }
        }

        let mut checksum = PartChecksum::new();
        let mut written = 0u64;
        let mut writer = self
            .staging_fs
            .open_at(&self.staging, task.range.start)
            .await?;
        // Every chunk is bounded by the attempt timeout, so a stalled body is retried
        let mut body = response.body.into_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if written + chunk.len() as u64 > expected_len {
                return Err(TransferError::transient("response longer than part"));
            }
            for piece in chunk.chunks(io.chunk_size()) {
                io.admit(piece.len() as u64).await?;
                writer.write(piece).await?;
                if self.enable_crc {
                    checksum.update(piece);
                }
                written += piece.len() as u64;
                io.advance(piece.len() as u64);
            }
        }

        if written != expected_len {
            return Err(TransferError::transient("response body ended early"));
        }
        writer.finish().await?;
        tracing::trace!("Part {} written at offset {}", task.index, task.range.start);

        Ok(PartOutcome {
            etag: None,
            crc64: self.enable_crc.then(|| checksum.value()),
        })
    }

    fn expected_crc64(&self) -> Option<u64> {
        self.info.crc64
    }

    async fn finalize(&self, _parts: &[Part]) -> Result<FinalizeOutcome> {
        match self.staging_fs.rename(&self.staging, &self.destination).await {
            Ok(()) => {
                self.emitter.part(PartEvent::TempFileRenamed {
                    path: self.destination.clone(),
                });
                Ok(FinalizeOutcome {
                    etag: self.info.etag.clone(),
                    crc64: None,
                })
            }
            Err(e) => {
                let error = TransferError::from(e);
                self.emitter.part(PartEvent::RenameTempFileFailed {
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    async fn abandon(&self) {
        // Kept for resume when a checkpoint refers to it
        if self.store.is_some() {
            return;
        }
        if let Err(e) = self.staging_fs.remove(&self.staging).await {
            tracing::warn!(
                "Failed to remove staging file {}: {}",
                self.staging.display(),
                e
            );
        }
    }
}

/// Downloads objects into local files
pub struct Downloader {
    runtime: Runtime,
    staging_fs: Arc<dyn StagingFs>,
}

impl Downloader {
    /// Create a downloader writing through the local filesystem
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
        config: TransferConfig,
    ) -> Result<Self> {
        Ok(Self {
            runtime: Runtime::new(transport, signer, config)?,
            staging_fs: Arc::new(LocalStagingFs::new()),
        })
    }

    /// Use a different staging filesystem
    pub fn with_staging_fs(mut self, staging_fs: Arc<dyn StagingFs>) -> Self {
        self.staging_fs = staging_fs;
        self
    }

    /// Use a different checkpoint store
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.runtime.store = store;
        self
    }

    /// Share a rate limiter with other transfers
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.runtime.limiter = Some(limiter);
        self
    }

    /// Effective configuration
    pub fn config(&self) -> &TransferConfig {
        &self.runtime.config
    }

    /// Checkpoint store in use
    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.runtime.store
    }

    /// Fetch an object's size and integrity metadata
    pub async fn head(
        &self,
        bucket: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo> {
        let policy = &self.runtime.config.retry;
        let response = retry_transient(policy, policy.max_attempts(), "head", cancel, || {
            self.runtime
                .executor
                .execute(ObjectRequest::new(Method::HEAD, bucket, key))
        })
        .await?;

        let size = response
            .content_length()
            .ok_or_else(|| TransferError::planning("object size unknown"))?;
        Ok(ObjectInfo {
            size,
            etag: response.etag(),
            last_modified: response.header_str(LAST_MODIFIED).map(str::to_string),
            crc64: response.crc64(),
        })
    }

    /// Download an object, resuming a previous attempt when its checkpoint matches
    pub async fn download_file(
        &self,
        request: &DownloadRequest,
        control: &TransferControl,
    ) -> Result<TransferSummary> {
        let (plan, driver) = match self.plan(request, control).await {
            Ok(planned) => planned,
            Err(e) => return Err(Emitter::new(control).rejected(e)),
        };
        let store = driver.store.clone();

        self.runtime
            .scheduler()
            .run(plan, PartFeed::Planned, store, control, driver)
            .await
    }

    async fn plan(
        &self,
        request: &DownloadRequest,
        control: &TransferControl,
    ) -> Result<(TransferPlan, Arc<DownloadDriver>)> {
        control.cancel().check()?;
        let info = self.head(&request.bucket, &request.key, control.cancel()).await?;
        let fingerprint = TransferFingerprint::new(
            Direction::Download,
            format!(
                "{}/{}:{}",
                request.bucket,
                request.key,
                request.destination.display()
            ),
            Some(info.size),
            info.modification_marker(),
        );
        let staging = staging_path(&request.destination);
        let ranges = PartPlanner::with_part_size(self.runtime.config.part_size).plan(info.size);
        let mut plan = TransferPlan::from_ranges(fingerprint.clone(), ranges);
        let multipart = plan.mode == PlanningMode::Multipart;

        let mut resumed = false;
        if multipart {
            if let Some(checkpoint) = self.runtime.store.load(&fingerprint).await? {
                let staging_kept = checkpoint.staging_path.as_deref() == Some(staging.as_path())
                    && self.staging_fs.exists(&staging).await?;
                if checkpoint.part_size != plan.part_size || !staging_kept {
                    tracing::debug!(
                        "Checkpoint {} does not match the current plan, starting over",
                        fingerprint.short_id()
                    );
                    self.runtime.store.invalidate(&fingerprint).await?;
                } else {
                    let restored = plan.apply_checkpoint(&checkpoint);
                    tracing::debug!(
                        "Restored {} parts of {} from checkpoint",
                        restored,
                        fingerprint.short_id()
                    );
                    resumed = true;
                }
            }
        }

        let driver = Arc::new(DownloadDriver {
            bucket: request.bucket.clone(),
            key: request.key.clone(),
            info,
            mode: plan.mode,
            executor: Arc::clone(&self.runtime.executor),
            staging_fs: Arc::clone(&self.staging_fs),
            staging,
            destination: request.destination.clone(),
            store: multipart.then(|| Arc::clone(&self.runtime.store)),
            fingerprint,
            part_size: plan.part_size,
            enable_crc: self.runtime.config.enable_crc,
            resumed,
            emitter: Emitter::new(control),
        });
        Ok((plan, driver))
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("config", &self.runtime.config)
            .field("executor", &self.runtime.executor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modification_marker_prefers_etag() {
        let mut info = ObjectInfo {
            size: 10,
            etag: Some("\"abc\"".to_string()),
            last_modified: Some("Mon, 19 Oct 2026 10:00:00 GMT".to_string()),
            crc64: None,
        };
        assert_eq!(info.modification_marker(), "\"abc\"");

        info.etag = None;
        assert_eq!(info.modification_marker(), "Mon, 19 Oct 2026 10:00:00 GMT");

        info.last_modified = None;
        assert_eq!(info.modification_marker(), "");
    }
}
