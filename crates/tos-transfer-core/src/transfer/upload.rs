//! Uploads
//!
//! Files are uploaded with a single `PUT` when they fit in one part and as a
//! resumable multipart upload otherwise. Streams of unknown length are read
//! one part ahead: a short first read becomes a single `PUT`, anything longer
//! becomes a multipart upload fed lazily to the scheduler.

use super::plan::{Part, TransferPlan};
use super::scheduler::{
    BoxedReader, FinalizeOutcome, PartDriver, PartFeed, PartIo, PartOutcome, PartTask,
};
use super::{Emitter, Runtime, TransferControl, TransferSummary};
use crate::checkpoint::{Checkpoint, CheckpointStore, Direction, TransferFingerprint};
use crate::client::{
    Codec, CompletedPart, IdleDeadline, JsonCodec, ObjectRequest, RequestBody, RequestExecutor,
    Signer, Transport,
};
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::event::PartEvent;
use crate::rate_limiter::RateLimiter;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::Method;
use http::header::{CONTENT_LENGTH, HeaderValue};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tos_transfer_files::{ByteRange, PartPlanner, PlanningMode, StreamedPlanner, crc64};

/// Upload of a local file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFileRequest {
    /// Destination bucket
    pub bucket: String,
    /// Destination key
    pub key: String,
    /// Source file
    pub path: PathBuf,
}

impl UploadFileRequest {
    /// Create a request
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            path: path.into(),
        }
    }
}

/// Upload of a stream of unknown length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStreamRequest {
    /// Destination bucket
    pub bucket: String,
    /// Destination key
    pub key: String,
}

impl UploadStreamRequest {
    /// Create a request
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

enum PartSource {
    File(PathBuf),
    Memory(Bytes),
    Streamed,
}

struct UploadDriver {
    bucket: String,
    key: String,
    source: PartSource,
    mode: PlanningMode,
    executor: Arc<RequestExecutor>,
    codec: Arc<dyn Codec>,
    store: Option<Arc<dyn CheckpointStore>>,
    fingerprint: TransferFingerprint,
    part_size: u64,
    enable_crc: bool,
    emitter: Emitter,
    upload_id: Mutex<Option<String>>,
    resumed_parts: usize,
    single_put: Mutex<Option<FinalizeOutcome>>,
}

impl UploadDriver {
    fn upload_id(&self) -> Result<String> {
        self.upload_id
            .lock()
            .clone()
            .ok_or_else(|| TransferError::planning("multipart upload not initiated"))
    }

    async fn part_data(&self, task: &PartTask) -> Result<Bytes> {
        match &self.source {
            PartSource::File(path) => read_range(path, task.range).await,
            PartSource::Memory(data) => {
                Ok(data.slice(task.range.start as usize..=task.range.end as usize))
            }
            PartSource::Streamed => task
                .data
                .clone()
                .ok_or_else(|| TransferError::planning("streamed part without data")),
        }
    }

    async fn initiate(&self) -> Result<String> {
        let request =
            ObjectRequest::new(Method::POST, &self.bucket, &self.key).with_query("uploads", "");
        let response = self.executor.execute(request).await?;
        let body = response.body.collect().await?;
        self.codec.decode_upload_id(&body)
    }

    async fn put_object(
        &self,
        body: RequestBody,
        len: u64,
        deadline: &IdleDeadline,
    ) -> Result<FinalizeOutcome> {
        let request = ObjectRequest::new(Method::PUT, &self.bucket, &self.key)
            .with_header(CONTENT_LENGTH, HeaderValue::from(len))
            .with_body(body);
        let response = self.executor.execute_with(request, deadline).await?;
        Ok(FinalizeOutcome {
            etag: response.etag(),
            crc64: response.crc64(),
        })
    }

    async fn complete(&self, parts: &[Part]) -> Result<FinalizeOutcome> {
        let upload_id = self.upload_id()?;
        let completed = parts
            .iter()
            .map(|p| {
                p.etag()
                    .map(|etag| CompletedPart {
                        part_number: p.part_number(),
                        etag: etag.to_string(),
                    })
                    .ok_or_else(|| TransferError::codec("completed part without etag"))
            })
            .collect::<Result<Vec<_>>>()?;
        let body = self.codec.encode_complete_parts(&completed)?;

        let request = ObjectRequest::new(Method::POST, &self.bucket, &self.key)
            .with_query("uploadId", upload_id)
            .with_body(RequestBody::Bytes(body));
        let response = self.executor.execute(request).await?;
        Ok(FinalizeOutcome {
            etag: response.etag(),
            crc64: response.crc64(),
        })
    }
}

/// Body that passes every chunk through the part's I/O gate
///
/// The attempt's deadline is paused while the gate waits for tokens.
fn gated_body(data: Bytes, io: PartIo, deadline: IdleDeadline) -> RequestBody {
    let stream = futures::stream::try_unfold((data, 0usize, io, deadline), next_chunk);
    RequestBody::Stream(stream.boxed())
}

type ChunkState = (Bytes, usize, PartIo, IdleDeadline);

async fn next_chunk(
    (data, pos, io, deadline): ChunkState,
) -> Result<Option<(Bytes, ChunkState)>> {
    if pos >= data.len() {
        return Ok(None);
    }
    let end = (pos + io.chunk_size()).min(data.len());
    {
        let _pause = deadline.pause();
        io.admit((end - pos) as u64).await?;
    }
    let chunk = data.slice(pos..end);
    io.advance(chunk.len() as u64);
    Ok(Some((chunk, (data, end, io, deadline))))
}

async fn read_range(path: &Path, range: ByteRange) -> Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(range.start)).await?;
    let mut buf = vec![0u8; range.len() as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

#[async_trait]
impl PartDriver for UploadDriver {
    async fn prepare(&self, _plan: &TransferPlan) -> Result<()> {
        if self.mode != PlanningMode::Multipart {
            return Ok(());
        }

        let existing = self.upload_id.lock().clone();
        if let Some(upload_id) = existing {
            tracing::debug!(
                "Resuming multipart upload {} with {} parts done",
                upload_id,
                self.resumed_parts
            );
            self.emitter.part(PartEvent::MultipartResumed {
                upload_id,
                completed_parts: self.resumed_parts,
            });
            return Ok(());
        }

        let upload_id = match self.initiate().await {
            Ok(id) => id,
            Err(error) => {
                self.emitter.part(PartEvent::CreateMultipartFailed {
                    error: error.clone(),
                });
                return Err(error);
            }
        };
        tracing::info!(
            "Initiated multipart upload {} for {}/{}",
            upload_id,
            self.bucket,
            self.key
        );

        if let Some(store) = &self.store {
            let checkpoint = Checkpoint::new(self.fingerprint.clone(), self.part_size)
                .with_upload_id(upload_id.clone());
            store.begin(checkpoint).await?;
        }
        *self.upload_id.lock() = Some(upload_id.clone());
        self.emitter.part(PartEvent::MultipartCreated { upload_id });
        Ok(())
    }

    async fn transfer_part(&self, task: PartTask, io: PartIo) -> Result<PartOutcome> {
        let data = self.part_data(&task).await?;
        let len = data.len() as u64;
        let local_crc = self.enable_crc.then(|| crc64(&data));
        let deadline = IdleDeadline::new();
        if io.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let body = gated_body(data, io, deadline.clone());

        if self.mode == PlanningMode::Simple {
            let outcome = self.put_object(body, len, &deadline).await?;
            *self.single_put.lock() = Some(outcome.clone());
            return Ok(PartOutcome {
                etag: outcome.etag,
                crc64: local_crc,
            });
        }

        let request = ObjectRequest::new(Method::PUT, &self.bucket, &self.key)
            .with_query("partNumber", task.part_number().to_string())
            .with_query("uploadId", self.upload_id()?)
            .with_header(CONTENT_LENGTH, HeaderValue::from(len))
            .with_body(body);
        let response = self.executor.execute_with(request, &deadline).await?;

        let etag = response
            .etag()
            .ok_or_else(|| TransferError::codec("part response without ETag"))?;
        if let (Some(expected), Some(actual)) = (local_crc, response.crc64()) {
            if expected != actual {
                return Err(TransferError::DataIntegrity { expected, actual });
            }
        }

        Ok(PartOutcome {
            etag: Some(etag),
            crc64: local_crc,
        })
    }

    async fn finalize(&self, parts: &[Part]) -> Result<FinalizeOutcome> {
        match self.mode {
            PlanningMode::Simple if parts.is_empty() => {
                self.put_object(RequestBody::Empty, 0, &IdleDeadline::new())
                    .await
            }
            PlanningMode::Simple => Ok(self.single_put.lock().clone().unwrap_or_default()),
            PlanningMode::Multipart => match self.complete(parts).await {
                Ok(outcome) => {
                    self.emitter.part(PartEvent::MultipartCompleted);
                    Ok(outcome)
                }
                Err(error) => {
                    self.emitter.part(PartEvent::CompleteMultipartFailed {
                        error: error.clone(),
                    });
                    Err(error)
                }
            },
        }
    }

    async fn abandon(&self) {
        // Without a checkpoint the upload can never be resumed
        if self.store.is_some() || self.mode != PlanningMode::Multipart {
            return;
        }
        let Some(upload_id) = self.upload_id.lock().clone() else {
            return;
        };
        let request = ObjectRequest::new(Method::DELETE, &self.bucket, &self.key)
            .with_query("uploadId", upload_id.clone());
        match self.executor.execute(request).await {
            Ok(_) => {
                tracing::debug!("Aborted multipart upload {}", upload_id);
                self.emitter.part(PartEvent::MultipartAborted { upload_id });
            }
            Err(e) => tracing::warn!("Failed to abort multipart upload {}: {}", upload_id, e),
        }
    }
}

/// Uploads files and streams
pub struct Uploader {
    runtime: Runtime,
    codec: Arc<dyn Codec>,
}

impl Uploader {
    /// Create an uploader with the built-in JSON codec
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
        config: TransferConfig,
    ) -> Result<Self> {
        Ok(Self {
            runtime: Runtime::new(transport, signer, config)?,
            codec: Arc::new(JsonCodec),
        })
    }

    /// Use a different protocol body codec
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
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

    /// Fingerprint of a file upload from the file's current metadata
    pub async fn fingerprint(&self, request: &UploadFileRequest) -> Result<TransferFingerprint> {
        let metadata = tokio::fs::metadata(&request.path).await?;
        if !metadata.is_file() {
            return Err(TransferError::Planning(Cow::Owned(format!(
                "{} is not a regular file",
                request.path.display()
            ))));
        }
        let marker = metadata
            .modified()
            .ok()
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos().to_string())
            .unwrap_or_default();

        Ok(TransferFingerprint::new(
            Direction::Upload,
            format!("{}/{}:{}", request.bucket, request.key, request.path.display()),
            Some(metadata.len()),
            marker,
        ))
    }

    /// Upload a file, resuming a previous attempt when its checkpoint matches
    pub async fn upload_file(
        &self,
        request: &UploadFileRequest,
        control: &TransferControl,
    ) -> Result<TransferSummary> {
        let (plan, driver) = match self.plan_file(request, control).await {
            Ok(planned) => planned,
            Err(e) => return Err(Emitter::new(control).rejected(e)),
        };
        let store = driver.store.clone();

        self.runtime
            .scheduler()
            .run(plan, PartFeed::Planned, store, control, driver)
            .await
    }

    async fn plan_file(
        &self,
        request: &UploadFileRequest,
        control: &TransferControl,
    ) -> Result<(TransferPlan, Arc<UploadDriver>)> {
        control.cancel().check()?;
        let fingerprint = self.fingerprint(request).await?;
        let size = fingerprint.total_size.unwrap_or(0);
        let ranges = PartPlanner::with_part_size(self.runtime.config.part_size).plan(size);
        let mut plan = TransferPlan::from_ranges(fingerprint.clone(), ranges);
        let multipart = plan.mode == PlanningMode::Multipart;

        let mut upload_id = None;
        let mut resumed_parts = 0;
        if multipart {
            if let Some(checkpoint) = self.runtime.store.load(&fingerprint).await? {
                if checkpoint.part_size != plan.part_size || checkpoint.upload_id.is_none() {
                    tracing::debug!(
                        "Checkpoint {} does not match the current plan, starting over",
                        fingerprint.short_id()
                    );
                    self.runtime.store.invalidate(&fingerprint).await?;
                } else {
                    resumed_parts = plan.apply_checkpoint(&checkpoint);
                    upload_id = checkpoint.upload_id;
                }
            }
        }

        let driver = Arc::new(UploadDriver {
            bucket: request.bucket.clone(),
            key: request.key.clone(),
            source: PartSource::File(request.path.clone()),
            mode: plan.mode,
            executor: Arc::clone(&self.runtime.executor),
            codec: Arc::clone(&self.codec),
            store: multipart.then(|| Arc::clone(&self.runtime.store)),
            fingerprint,
            part_size: plan.part_size,
            enable_crc: self.runtime.config.enable_crc,
            emitter: Emitter::new(control),
            upload_id: Mutex::new(upload_id),
            resumed_parts,
            single_put: Mutex::new(None),
        });
        Ok((plan, driver))
    }

    /// Upload a stream of unknown length
    ///
    /// Stream uploads keep no checkpoint; a failed multipart stream upload is
    /// aborted on the service. A cancelled one is left in place, to be
    /// discarded with [`Uploader::abort_upload`] and the id from
    /// `MultipartCreated`.
    pub async fn upload_stream<R>(
        &self,
        request: &UploadStreamRequest,
        reader: R,
        control: &TransferControl,
    ) -> Result<TransferSummary>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let planned = self.plan_stream(request, Box::new(reader), control).await;
        let (plan, feed, source) = match planned {
            Ok(planned) => planned,
            Err(e) => return Err(Emitter::new(control).rejected(e)),
        };

        let driver = Arc::new(UploadDriver {
            bucket: request.bucket.clone(),
            key: request.key.clone(),
            source,
            mode: plan.mode,
            executor: Arc::clone(&self.runtime.executor),
            codec: Arc::clone(&self.codec),
            store: None,
            fingerprint: plan.fingerprint.clone(),
            part_size: plan.part_size,
            enable_crc: self.runtime.config.enable_crc,
            emitter: Emitter::new(control),
            upload_id: Mutex::new(None),
            resumed_parts: 0,
            single_put: Mutex::new(None),
        });

        self.runtime
            .scheduler()
            .run(plan, feed, None, control, driver)
            .await
    }

    /// Read up to two parts ahead to pick simple or multipart mode
    async fn plan_stream(
        &self,
        request: &UploadStreamRequest,
        reader: BoxedReader,
        control: &TransferControl,
    ) -> Result<(TransferPlan, PartFeed, PartSource)> {
        control.cancel().check()?;
        let part_size = self.runtime.config.part_size;
        let mut planner = StreamedPlanner::new(reader, part_size);
        let resource_key = format!("{}/{}", request.bucket, request.key);

        let first = planner.next_part().await?;
        let second = match &first {
            Some(part) if !part.last => planner.next_part().await?,
            _ => None,
        };

        match (first, second) {
            (Some(first), Some(second)) => {
                let fingerprint = TransferFingerprint::new(Direction::Upload, resource_key, None, "");
                let plan = TransferPlan::streamed(fingerprint, planner.part_size());
                let feed = PartFeed::Streamed {
                    buffered: VecDeque::from([first, second]),
                    planner,
                };
                Ok((plan, feed, PartSource::Streamed))
            }
            (first, _) => {
                let data = first.map(|p| p.data).unwrap_or_default();
                let len = data.len() as u64;
                tracing::debug!("Stream ended after {} bytes, using a single request", len);
                let fingerprint =
                    TransferFingerprint::new(Direction::Upload, resource_key, Some(len), "");
                let ranges = PartPlanner::with_part_size(part_size.max(len)).plan(len);
                let plan = TransferPlan::from_ranges(fingerprint, ranges);
                Ok((plan, PartFeed::Planned, PartSource::Memory(data)))
            }
        }
    }

    /// Abort the stored multipart upload of a file, if any
    ///
    /// Returns true when an upload was aborted. The checkpoint is removed.
    pub async fn abort(&self, request: &UploadFileRequest) -> Result<bool> {
        let fingerprint = self.fingerprint(request).await?;
        let Some(checkpoint) = self.runtime.store.load(&fingerprint).await? else {
            return Ok(false);
        };

        let aborted = match &checkpoint.upload_id {
            Some(upload_id) => {
                self.abort_upload(&request.bucket, &request.key, upload_id)
                    .await?;
                true
            }
            None => false,
        };

        self.runtime.store.invalidate(&fingerprint).await?;
        Ok(aborted)
    }

    /// Abort a multipart upload by id
    pub async fn abort_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let request =
            ObjectRequest::new(Method::DELETE, bucket, key).with_query("uploadId", upload_id);
        self.runtime.executor.execute(request).await?;
        tracing::info!("Aborted multipart upload {}", upload_id);
        Ok(())
    }
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("config", &self.runtime.config)
            .field("executor", &self.runtime.executor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_range() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let data = read_range(&path, ByteRange::new(3, 6).unwrap()).await.unwrap();
        assert_eq!(&data[..], b"3456");

        let err = read_range(&path, ByteRange::new(8, 20).unwrap()).await.unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }

    #[tokio::test]
    async fn test_fingerprint_rejects_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let uploader = Uploader::new(
            Arc::new(NoTransport),
            Arc::new(crate::client::AnonymousSigner),
            TransferConfig::default(),
        )
        .unwrap();

        let err = uploader
            .fingerprint(&UploadFileRequest::new("b", "k", dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Planning(_)));
    }

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn send(&self, _request: ObjectRequest) -> Result<crate::client::ObjectResponse> {
            Err(TransferError::transient("offline"))
        }
    }
}
