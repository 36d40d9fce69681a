//! Bounded-concurrency part scheduler
//!
//! Drives the parts of one [`TransferPlan`] through a [`PartDriver`]:
//!
//! 1. `Started`, then the driver's `prepare` step.
//! 2. Parts not already done are dispatched to tokio tasks, at most
//!    `concurrency` at a time. Each attempt gets a fresh [`PartIo`] gate that
//!    enforces cancellation and rate limiting per chunk and feeds progress.
//! 3. Transient failures are retried with backoff; a part that exhausts its
//!    budget stops dispatch and cancels the remaining workers.
//! 4. With every part done the combined CRC-64 is checked, the driver
//!    finalizes (retried for transient errors), `Succeed` is emitted and the
//!    checkpoint cleared.
//!
//! Failures let the driver clean up, emit `Failed` and keep the checkpoint.
//! Cancellation emits `Cancelled` and sends no further requests.

use super::plan::{Part, PartState, TransferPlan};
use super::{Emitter, TransferControl, TransferSummary, retry_transient, sleep_or_cancel};
use crate::cancel::CancellationToken;
use crate::checkpoint::{CheckpointStore, TransferFingerprint};
use crate::config::{RetryPolicy, TransferConfig};
use crate::error::{Result, TransferError};
use crate::event::{DataTransferEvent, PartEvent};
use crate::progress::{ProgressMeter, TransferStatus};
use crate::rate_limiter::RateLimiter;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tos_transfer_files::{ByteRange, ChecksumAccumulator, StreamedPart, StreamedPlanner};

/// Reader type for streamed payloads
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Source of parts for a scheduler run
pub enum PartFeed {
    /// Use the parts of the plan
    Planned,
    /// Pull parts from a stream, one per free worker
    Streamed {
        /// Parts read ahead before the run, dispatched first
        buffered: VecDeque<StreamedPart>,
        /// Remainder of the stream
        planner: StreamedPlanner<BoxedReader>,
    },
}

impl std::fmt::Debug for PartFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planned => write!(f, "Planned"),
            Self::Streamed { buffered, planner } => f
                .debug_struct("Streamed")
                .field("buffered", &buffered.len())
                .field("bytes_read", &planner.bytes_read())
                .finish(),
        }
    }
}

/// One attempt of one part
#[derive(Debug, Clone)]
pub struct PartTask {
    /// Zero-based part index
    pub index: u32,
    /// Bytes covered
    pub range: ByteRange,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Part contents for streamed payloads
    pub data: Option<Bytes>,
}

impl PartTask {
    /// One-based part number used on the wire
    pub fn part_number(&self) -> u32 {
        self.index + 1
    }
}

/// Result of a successful part attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartOutcome {
    /// Per-part integrity token from the service
    pub etag: Option<String>,
    /// CRC-64 of the part contents
    pub crc64: Option<u64>,
}

/// Result of the finalize step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeOutcome {
    /// Object etag
    pub etag: Option<String>,
    /// Whole-object CRC-64 reported by the service
    pub crc64: Option<u64>,
}

/// Moves parts of one direction
#[async_trait]
pub trait PartDriver: Send + Sync {
    /// Runs once after `Started`, before any part (retried like finalize)
    async fn prepare(&self, _plan: &TransferPlan) -> Result<()> {
        Ok(())
    }

    /// Run one attempt of one part
    ///
    /// Must call [`PartIo::admit`] before and [`PartIo::advance`] after every
    /// chunk, and build a freshly signed request.
    async fn transfer_part(&self, task: PartTask, io: PartIo) -> Result<PartOutcome>;

    /// Whole-payload CRC-64 known before finalize (downloads)
    fn expected_crc64(&self) -> Option<u64> {
        None
    }

    /// Commit the transfer; `parts` are all parts in index order
    async fn finalize(&self, parts: &[Part]) -> Result<FinalizeOutcome>;

    /// Called once when the transfer fails, never after cancellation
    async fn abandon(&self) {}
}

/// Running byte total shared by all workers
///
/// The total is updated and reported under one lock, so `Rw` events are
/// delivered with non-decreasing `consumed_bytes`.
struct ProgressAccumulator {
    emitter: Emitter,
    state: Mutex<ProgressState>,
}

struct ProgressState {
    consumed: u64,
    parts_done: usize,
    total: Option<u64>,
    meter: ProgressMeter,
}

impl ProgressAccumulator {
    fn new(emitter: Emitter, plan: &TransferPlan, restored_parts: usize) -> Self {
        let parts_total = plan.total_bytes.map(|_| plan.part_count());
        Self {
            emitter,
            state: Mutex::new(ProgressState {
                consumed: plan.done_bytes(),
                parts_done: restored_parts,
                total: plan.total_bytes,
                meter: ProgressMeter::start(plan.total_bytes, parts_total),
            }),
        }
    }

    fn add(&self, delta: u64) {
        if delta == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.consumed += delta;
        self.emitter.data(DataTransferEvent::Rw {
            rw_once_bytes: delta,
            consumed_bytes: state.consumed,
            total_bytes: state.total,
        });
        let (consumed, parts_done) = (state.consumed, state.parts_done);
        let snapshot = state.meter.record(consumed, parts_done);
        self.emitter.progress(snapshot);
    }

    fn part_done(&self) {
        let mut state = self.state.lock();
        state.parts_done += 1;
        let (consumed, parts_done) = (state.consumed, state.parts_done);
        let snapshot = state.meter.record(consumed, parts_done);
        self.emitter.progress(snapshot);
    }

    fn set_status(&self, status: TransferStatus) {
        let snapshot = self.state.lock().meter.set_status(status);
        self.emitter.progress(snapshot);
    }
}

/// Per-attempt I/O gate handed to a [`PartDriver`]
///
/// Cloning is cheap; clones share the attempt's byte count.
#[derive(Clone)]
pub struct PartIo {
    index: u32,
    chunk_size: usize,
    cancel: CancellationToken,
    limiter: Option<Arc<RateLimiter>>,
    progress: Arc<ProgressAccumulator>,
    attempt_bytes: Arc<AtomicU64>,
    high_water: Arc<AtomicU64>,
}

impl PartIo {
    /// Index of the part this gate belongs to
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Preferred chunk size
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Whether the attempt should stop
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until `len` bytes may be moved
    ///
    /// Fails with [`TransferError::Cancelled`] once cancellation is signalled.
    pub async fn admit(&self, len: u64) -> Result<()> {
        self.cancel.check()?;
        if let Some(limiter) = &self.limiter {
            let step = limiter.capacity();
            let mut remaining = len;
            while remaining > 0 {
                let want = remaining.min(step);
                limiter.wait_for(want, &self.cancel).await?;
                remaining -= want;
            }
        }
        Ok(())
    }

    /// Report `len` bytes moved
    ///
    /// Bytes below what an earlier attempt of the same part already reported
    /// are not reported again.
    pub fn advance(&self, len: u64) {
        let sent = self.attempt_bytes.fetch_add(len, Ordering::SeqCst) + len;
        let previous = self.high_water.fetch_max(sent, Ordering::SeqCst);
        if sent > previous {
            self.progress.add(sent - previous);
        }
    }

    /// Bytes reported by this attempt so far
    pub fn bytes_moved(&self) -> u64 {
        self.attempt_bytes.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PartIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartIo")
            .field("index", &self.index)
            .field("chunk_size", &self.chunk_size)
            .field("bytes_moved", &self.bytes_moved())
            .finish()
    }
}

struct WorkerContext {
    driver: Arc<dyn PartDriver>,
    store: Option<Arc<dyn CheckpointStore>>,
    fingerprint: TransferFingerprint,
    emitter: Emitter,
    progress: Arc<ProgressAccumulator>,
    cancel: CancellationToken,
    limiter: Option<Arc<RateLimiter>>,
    chunk_size: usize,
    retry: RetryPolicy,
}

impl WorkerContext {
    fn gate(&self, index: u32, high_water: &Arc<AtomicU64>) -> PartIo {
        PartIo {
            index,
            chunk_size: self.chunk_size,
            cancel: self.cancel.clone(),
            limiter: self.limiter.clone(),
            progress: Arc::clone(&self.progress),
            attempt_bytes: Arc::new(AtomicU64::new(0)),
            high_water: Arc::clone(high_water),
        }
    }

    fn abort(&self, part: Part) -> (Part, Result<()>) {
        tracing::debug!("Part {} aborted", part.index);
        self.emitter.part(PartEvent::PartAborted { index: part.index });
        (part, Err(TransferError::Cancelled))
    }
}

/// Drive one part until it is done, fails for good, or is cancelled
async fn run_part(
    ctx: Arc<WorkerContext>,
    mut part: Part,
    data: Option<Bytes>,
    _permit: OwnedSemaphorePermit,
) -> (Part, Result<()>) {
    let high_water = Arc::new(AtomicU64::new(0));
    let max_attempts = ctx.retry.max_attempts();

    loop {
        if ctx.cancel.is_cancelled() {
            return ctx.abort(part);
        }

        part.start_attempt();
        let task = PartTask {
            index: part.index,
            range: part.range,
            attempt: part.attempts(),
            data: data.clone(),
        };
        tracing::trace!(
            "Part {} attempt {} ({} bytes)",
            part.index,
            part.attempts(),
            part.len()
        );

        let io = ctx.gate(part.index, &high_water);
        match ctx.driver.transfer_part(task, io).await {
            Ok(outcome) => {
                part.complete(outcome.etag, outcome.crc64);
                if let Some(store) = &ctx.store {
                    if let Err(e) = store
                        .record_part_done(&ctx.fingerprint, part.index, part.record())
                        .await
                    {
                        tracing::warn!("Failed to checkpoint part {}: {}", part.index, e);
                    }
                }
                ctx.emitter.part(PartEvent::PartSucceeded {
                    index: part.index,
                    range: part.range,
                });
                ctx.progress.part_done();
                return (part, Ok(()));
            }
            Err(err) => {
                part.fail();
                if ctx.cancel.is_cancelled() || err.is_cancelled() {
                    return ctx.abort(part);
                }

                ctx.emitter.part(PartEvent::PartFailed {
                    index: part.index,
                    attempt: part.attempts(),
                    error: err.clone(),
                });

                if err.should_retry() && part.attempts() < max_attempts {
                    let backoff = ctx.retry.backoff_duration(part.attempts() - 1);
                    tracing::warn!(
                        "Part {} attempt {}/{} failed: {}, retrying in {:?}",
                        part.index,
                        part.attempts(),
                        max_attempts,
                        err,
                        backoff
                    );
                    if sleep_or_cancel(backoff, &ctx.cancel).await.is_err() {
                        return ctx.abort(part);
                    }
                    part.retry();
                    continue;
                }

                tracing::error!(
                    "Part {} failed after {} attempts: {}",
                    part.index,
                    part.attempts(),
                    err
                );
                return (part, Err(err));
            }
        }
    }
}

type Joined = std::result::Result<(Part, Result<()>), tokio::task::JoinError>;

fn collect(joined: Joined, done: &mut BTreeMap<u32, Part>, failure: &mut Option<TransferError>) {
    match joined {
        Ok((part, Ok(()))) => {
            done.insert(part.index, part);
        }
        Ok((_, Err(err))) => {
            failure.get_or_insert(err);
        }
        Err(join_err) => {
            failure.get_or_insert(join_err.into());
        }
    }
}

fn streamed_task(part: StreamedPart) -> (Part, Option<Bytes>) {
    let end = part.offset + part.data.len() as u64 - 1;
    let range = ByteRange {
        start: part.offset,
        end,
    };
    (Part::new(part.index, range), Some(part.data))
}

fn combined_crc(parts: &[Part]) -> Option<u64> {
    let mut acc = ChecksumAccumulator::new();
    for part in parts {
        acc.insert(part.index, part.crc64()?, part.len());
    }
    Some(acc.combined())
}

/// Bounded worker pool for the parts of one transfer
#[derive(Debug, Clone)]
pub struct TransferScheduler {
    concurrency: usize,
    chunk_size: usize,
    retry: RetryPolicy,
    limiter: Option<Arc<RateLimiter>>,
    enable_crc: bool,
}

impl TransferScheduler {
    /// Create a scheduler from configuration
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            chunk_size: config.chunk_size.max(1),
            retry: config.retry.clone(),
            limiter: config
                .rate_limit
                .as_ref()
                .map(|c| Arc::new(RateLimiter::from_config(c))),
            enable_crc: config.enable_crc,
        }
    }

    /// Replace the rate limiter (share one limiter across transfers, or `None`)
    pub fn with_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Maximum simultaneous in-flight parts
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run a transfer to its terminal state
    ///
    /// Parts of `plan` already marked done (restored from a checkpoint) are
    /// skipped. When `store` is given every completed part is recorded in it
    /// and the record is cleared on success.
    pub async fn run(
        &self,
        plan: TransferPlan,
        mut feed: PartFeed,
        store: Option<Arc<dyn CheckpointStore>>,
        control: &TransferControl,
        driver: Arc<dyn PartDriver>,
    ) -> Result<TransferSummary> {
        let started = Instant::now();
        let emitter = Emitter::new(control);
        let restored = plan
            .parts
            .iter()
            .filter(|p| p.state() == PartState::Done)
            .count();

        tracing::info!(
            "Starting transfer {}: {:?} bytes, {} parts ({} resumed), concurrency {}",
            plan.fingerprint.short_id(),
            plan.total_bytes,
            plan.part_count(),
            restored,
            self.concurrency
        );
        emitter.data(DataTransferEvent::Started {
            total_bytes: plan.total_bytes,
        });

        let progress = Arc::new(ProgressAccumulator::new(emitter.clone(), &plan, restored));
        let result = self
            .drive(&plan, &mut feed, store.clone(), control, &driver, &progress)
            .await;

        match result {
            Ok(mut summary) => {
                summary.resumed_parts = restored;
                summary.elapsed = started.elapsed();

                progress.set_status(TransferStatus::Complete);
                emitter.data(DataTransferEvent::Succeed {
                    total_bytes: summary.total_bytes,
                });
                if let Some(store) = &store {
                    if let Err(e) = store.finalize(&plan.fingerprint).await {
                        tracing::warn!(
                            "Failed to clear checkpoint {}: {}",
                            plan.fingerprint.short_id(),
                            e
                        );
                    }
                }

                tracing::info!(
                    "Transfer {} complete: {} bytes in {} parts ({:?})",
                    plan.fingerprint.short_id(),
                    summary.total_bytes,
                    summary.part_count,
                    summary.elapsed
                );
                Ok(summary)
            }
            Err(err) => {
                // Cancellation is acknowledged without touching the network
                if control.cancel().is_cancelled() || err.is_cancelled() {
                    tracing::info!("Transfer {} cancelled", plan.fingerprint.short_id());
                    emitter.cancelled();
                    Err(TransferError::Cancelled)
                } else {
                    tracing::error!(
                        "Transfer {} failed: {}",
                        plan.fingerprint.short_id(),
                        err
                    );
                    driver.abandon().await;
                    progress.set_status(TransferStatus::Failed);
                    emitter.data(DataTransferEvent::Failed { error: err.clone() });
                    Err(err)
                }
            }
        }
    }

    async fn drive(
        &self,
        plan: &TransferPlan,
        feed: &mut PartFeed,
        store: Option<Arc<dyn CheckpointStore>>,
        control: &TransferControl,
        driver: &Arc<dyn PartDriver>,
        progress: &Arc<ProgressAccumulator>,
    ) -> Result<TransferSummary> {
        let cancel = control.cancel();
        self.retry_step("prepare", cancel, move || driver.prepare(plan))
            .await?;

        let worker_cancel = cancel.child();
        let ctx = Arc::new(WorkerContext {
            driver: Arc::clone(driver),
            store,
            fingerprint: plan.fingerprint.clone(),
            emitter: Emitter::new(control),
            progress: Arc::clone(progress),
            cancel: worker_cancel.clone(),
            limiter: self.limiter.clone(),
            chunk_size: self.chunk_size,
            retry: self.retry.clone(),
        });

        let mut queue: VecDeque<(Part, Option<Bytes>)> = plan
            .pending()
            .map(|p| (p.clone(), None))
            .collect();
        let mut done: BTreeMap<u32, Part> = plan
            .parts
            .iter()
            .filter(|p| p.state() == PartState::Done)
            .map(|p| (p.index, p.clone()))
            .collect();
        let mut failure: Option<TransferError> = None;
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                collect(joined, &mut done, &mut failure);
            }
            if failure.is_some() || cancel.is_cancelled() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // A worker drops its permit just before its result becomes joinable
            while tasks.len() >= self.concurrency {
                match tasks.join_next().await {
                    Some(joined) => collect(joined, &mut done, &mut failure),
                    None => break,
                }
            }
            if failure.is_some() {
                break;
            }

            let next = match feed {
                PartFeed::Planned => queue.pop_front(),
                PartFeed::Streamed { buffered, planner } => {
                    let streamed = match buffered.pop_front() {
                        Some(part) => Some(part),
                        None => match planner.next_part().await {
                            Ok(part) => part,
                            Err(e) => {
                                failure = Some(e.into());
                                break;
                            }
                        },
                    };
                    streamed.map(streamed_task)
                }
            };
            let Some((part, data)) = next else {
                break;
            };

            tasks.spawn(run_part(Arc::clone(&ctx), part, data, permit));
        }

        if failure.is_some() {
            worker_cancel.cancel();
        }
        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut done, &mut failure);
            if failure.is_some() && !worker_cancel.is_cancelled() {
                tracing::debug!("Stopping in-flight parts after failure");
                worker_cancel.cancel();
            }
        }

        cancel.check()?;
        if let Some(err) = failure {
            return Err(err);
        }

        let parts: Vec<Part> = done.into_values().collect();
        let total_bytes: u64 = parts.iter().map(Part::len).sum();
        if let PartFeed::Planned = feed {
            if parts.len() != plan.part_count() || plan.total_bytes != Some(total_bytes) {
                return Err(TransferError::Internal(Cow::Owned(format!(
                    "{} of {} parts done covering {} bytes",
                    parts.len(),
                    plan.part_count(),
                    total_bytes
                ))));
            }
        }

        let crc64 = if self.enable_crc {
            combined_crc(&parts)
        } else {
            None
        };
        if let (Some(expected), Some(actual)) = (driver.expected_crc64(), crc64) {
            if self.enable_crc && expected != actual {
                tracing::error!(
                    "CRC-64 mismatch before finalize: expected {:#018x}, got {:#018x}",
                    expected,
                    actual
                );
                return Err(TransferError::DataIntegrity { expected, actual });
            }
        }

        progress.set_status(TransferStatus::Finalizing);
        let parts_ref = parts.as_slice();
        let outcome = self
            .retry_step("finalize", cancel, move || driver.finalize(parts_ref))
            .await
            .map_err(|e| TransferError::finalize(&e))?;

        if let (Some(reported), Some(actual)) = (outcome.crc64, crc64) {
            if reported != actual {
                tracing::error!(
                    "CRC-64 mismatch after finalize: service {:#018x}, local {:#018x}",
                    reported,
                    actual
                );
                return Err(TransferError::DataIntegrity {
                    expected: actual,
                    actual: reported,
                });
            }
        }

        Ok(TransferSummary {
            total_bytes,
            part_count: parts.len(),
            resumed_parts: 0,
            crc64,
            etag: outcome.etag,
            elapsed: Duration::ZERO,
        })
    }

    /// Run a whole-transfer step, retrying transient errors
    async fn retry_step<T, F, Fut>(&self, step: &str, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.retry.max_finalize_attempts.max(1);
        retry_transient(&self.retry, max_attempts, step, cancel, op).await
    }
}
