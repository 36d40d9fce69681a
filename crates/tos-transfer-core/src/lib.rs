//! # tos-transfer core
//!
//! Engine for moving large objects between local files and an object-storage
//! service: resumable, concurrent, rate-limited, and verified end to end with
//! CRC-64.
//!
//! This crate provides:
//! - Upload (file and stream) and download orchestration
//! - A bounded-concurrency part scheduler with retries and backoff
//! - A token-bucket rate limiter shared across workers
//! - Checkpoint stores for resuming interrupted transfers
//! - Typed lifecycle events and progress snapshots
//! - Cooperative cancellation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Uploader / Downloader                           │
//! │   (plan, reconcile with checkpoint, direction-specific driver)  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                   TransferScheduler                              │
//! │   (worker pool, retries, rate limiting, progress, finalize)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │          Transport / Signer / Codec / StagingFs                  │
//! │   (collaborators supplied by the embedding client)              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine does not speak HTTP or sign requests itself; callers plug in a
//! [`Transport`] and a [`Signer`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod progress;
pub mod rate_limiter;
pub mod transfer;

pub use cancel::CancellationToken;
pub use checkpoint::{
    Checkpoint, CheckpointStore, Direction, FileCheckpointStore, MemoryCheckpointStore,
    PartRecord, TransferFingerprint,
};
pub use client::{
    AnonymousSigner, Codec, CompletedPart, HEADER_CRC64, IdleDeadline, IdlePause, JsonCodec,
    ObjectRequest, ObjectResponse, RequestBody, RequestExecutor, ResponseBody, Signer, Transport,
};
pub use config::{RetryPolicy, TransferConfig};
pub use error::{Result, TransferError};
pub use event::{DataTransferEvent, EventBus, Observer, PartEvent};
pub use progress::{ProgressMeter, TransferProgress, TransferStatus};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use transfer::{
    DownloadRequest, Downloader, ObjectInfo, Part, PartState, TransferControl, TransferPlan,
    TransferScheduler, TransferSummary, UploadFileRequest, UploadStreamRequest, Uploader,
};

pub use tos_transfer_files::{ByteRange, PlanningMode, StagingFs};
