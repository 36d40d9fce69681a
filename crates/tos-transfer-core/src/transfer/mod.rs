//! Upload and download orchestration
//!
//! [`Uploader`] and [`Downloader`] plan a transfer, reconcile it with any
//! stored checkpoint, and hand the remaining parts to the
//! [`TransferScheduler`] through a [`PartDriver`] that knows how to move one
//! part of their direction.

mod download;
mod plan;
mod scheduler;
mod upload;

pub use download::{DownloadRequest, Downloader, ObjectInfo};
pub use plan::{Part, PartState, TransferPlan};
pub use scheduler::{
    BoxedReader, FinalizeOutcome, PartDriver, PartFeed, PartIo, PartOutcome, PartTask,
    TransferScheduler,
};
pub use upload::{UploadFileRequest, UploadStreamRequest, Uploader};

use crate::cancel::CancellationToken;
use crate::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use crate::client::{RequestExecutor, Signer, Transport};
use crate::config::{RetryPolicy, TransferConfig};
use crate::error::{Result, TransferError};
use crate::event::{DataTransferEvent, EventBus, PartEvent};
use crate::progress::TransferProgress;
use crate::rate_limiter::RateLimiter;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Observers and cancellation for one transfer
#[derive(Debug, Clone, Default)]
pub struct TransferControl {
    bus: Arc<EventBus>,
    cancel: CancellationToken,
}

impl TransferControl {
    /// Fresh bus and token
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing bus
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Use an existing cancellation token
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Event bus
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Cancellation token
    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Result of a successful transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    /// Bytes in the transferred payload
    pub total_bytes: u64,

    /// Parts in the transfer, including resumed ones
    pub part_count: usize,

    /// Parts skipped because a checkpoint recorded them as done
    pub resumed_parts: usize,

    /// Whole-payload CRC-64, when integrity checking was enabled
    pub crc64: Option<u64>,

    /// Object etag reported at finalize
    pub etag: Option<String>,

    /// Wall-clock duration
    pub elapsed: Duration,
}

/// Event emission that goes quiet once cancellation is requested
#[derive(Clone)]
pub(crate) struct Emitter {
    bus: Arc<EventBus>,
    cancel: CancellationToken,
}

impl Emitter {
    pub(crate) fn new(control: &TransferControl) -> Self {
        Self {
            bus: Arc::clone(&control.bus),
            cancel: control.cancel.clone(),
        }
    }

    pub(crate) fn data(&self, event: DataTransferEvent) {
        if !self.cancel.is_cancelled() {
            self.bus.emit_data(event);
        }
    }

    pub(crate) fn part(&self, event: PartEvent) {
        if !self.cancel.is_cancelled() {
            self.bus.emit_part(event);
        }
    }

    pub(crate) fn progress(&self, progress: TransferProgress) {
        if !self.cancel.is_cancelled() {
            self.bus.emit_progress(progress);
        }
    }

    /// Acknowledge cancellation; nothing is delivered after this
    pub(crate) fn cancelled(&self) {
        self.bus.emit_data(DataTransferEvent::Cancelled);
    }

    /// Report an error raised before the scheduler took over
    ///
    /// A failure is still preceded by `Started` with an unknown length so
    /// observers always see a transfer open before it closes. Cancellation
    /// is reported alone.
    pub(crate) fn rejected(&self, error: TransferError) -> TransferError {
        if self.cancel.is_cancelled() || error.is_cancelled() {
            self.cancelled();
            TransferError::Cancelled
        } else {
            tracing::error!("Transfer rejected: {}", error);
            self.bus
                .emit_data(DataTransferEvent::Started { total_bytes: None });
            self.bus.emit_data(DataTransferEvent::Failed {
                error: error.clone(),
            });
            error
        }
    }
}

/// Collaborators shared by the uploader and the downloader
pub(crate) struct Runtime {
    pub(crate) executor: Arc<RequestExecutor>,
    pub(crate) config: TransferConfig,
    pub(crate) store: Arc<dyn CheckpointStore>,
    pub(crate) limiter: Option<Arc<RateLimiter>>,
}

impl Runtime {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
        config: TransferConfig,
    ) -> Result<Self> {
        let config = config.validate()?;
        let executor = Arc::new(RequestExecutor::new(
            transport,
            signer,
            config.request_timeout(),
            config.retry.clone(),
        ));
        let store: Arc<dyn CheckpointStore> = match &config.checkpoint_dir {
            Some(dir) => Arc::new(FileCheckpointStore::new(dir)),
            None => Arc::new(MemoryCheckpointStore::new()),
        };
        let limiter = config
            .rate_limit
            .as_ref()
            .map(|c| Arc::new(RateLimiter::from_config(c)));

        Ok(Self {
            executor,
            config,
            store,
            limiter,
        })
    }

    pub(crate) fn scheduler(&self) -> TransferScheduler {
        TransferScheduler::new(&self.config).with_limiter(self.limiter.clone())
    }
}

/// Sleep unless cancellation comes first
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Run `op` up to `max_attempts` times while it fails transiently
pub(crate) async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    max_attempts: u32,
    step: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        cancel.check()?;
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.should_retry() && attempt < max_attempts => {
                let backoff = policy.backoff_duration(attempt - 1);
                tracing::warn!(
                    "{} attempt {}/{} failed: {}, retrying in {:?}",
                    step,
                    attempt,
                    max_attempts,
                    e,
                    backoff
                );
                sleep_or_cancel(backoff, cancel).await?;
            }
            Err(e) => return Err(e),
        }
    }
}
