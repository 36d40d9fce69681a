//! Error types for the transfer engine
//!
//! Errors are categorized to drive the retry policy:
//!
//! # Error Categories
//!
//! - **Transient**: network failures, per-attempt timeouts and retryable
//!   status codes. Retried up to the attempt budget with a freshly signed request.
//! - **Permanent**: everything else. Surfaced immediately; the checkpoint is
//!   kept so a later run can resume.
//!
//! # Example
//!
//! ```
//! use tos_transfer_core::TransferError;
//!
//! let err = TransferError::transient("connection reset");
//! assert!(err.should_retry());
//! assert!(!TransferError::Cancelled.should_retry());
//! ```

use std::borrow::Cow;
use thiserror::Error;
use tos_transfer_files::PlanError;

/// Errors surfaced by transfers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    // ============ Network Errors ============
    /// Network-level failure or retryable status; retried with fresh signing
    #[error("Transient network error: {0}")]
    TransientNetwork(Cow<'static, str>),

    /// A single attempt exceeded its time budget
    #[error("Request timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// The service rejected the request with a non-retryable status
    #[error("Request failed with status {status}: {message}")]
    Request {
        /// HTTP status code
        status: u16,
        /// Response summary
        message: Cow<'static, str>,
    },

    // ============ Integrity Errors ============
    /// End-to-end checksum mismatch
    #[error("Data integrity error: expected crc64 {expected:#018x}, got {actual:#018x}")]
    DataIntegrity {
        /// Checksum of the source data
        expected: u64,
        /// Checksum of the copy
        actual: u64,
    },

    // ============ Lifecycle Errors ============
    /// Cooperative cancellation was observed
    #[error("Transfer cancelled")]
    Cancelled,

    /// Inconsistent size or range input, detected before any I/O
    #[error("Planning error: {0}")]
    Planning(Cow<'static, str>),

    /// The complete/rename step failed after every part succeeded
    #[error("Finalize failed: {0}")]
    Finalize(Cow<'static, str>),

    // ============ Local Errors ============
    /// Local file I/O error
    #[error("File I/O error: {0}")]
    Io(String),

    /// Checkpoint persistence failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(Cow<'static, str>),

    /// Protocol body could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(Cow<'static, str>),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// A worker task ended abnormally
    #[error("Internal error: {0}")]
    Internal(Cow<'static, str>),
}

impl TransferError {
    /// Returns true if this error may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::TransientNetwork(_) | TransferError::Timeout(_)
        )
    }

    /// Returns true if this error will not succeed without intervention
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Returns true if the scheduler should re-sign and resubmit
    ///
    /// Per-attempt timeouts share the retry budget with other network errors.
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }

    /// Returns true for the cancellation kind
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    /// Create a transient error with static context (zero allocation)
    #[must_use]
    pub const fn transient(context: &'static str) -> Self {
        TransferError::TransientNetwork(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        TransferError::Timeout(Cow::Borrowed(context))
    }

    /// Create a planning error with static context (zero allocation)
    #[must_use]
    pub const fn planning(context: &'static str) -> Self {
        TransferError::Planning(Cow::Borrowed(context))
    }

    /// Create a codec error with static context (zero allocation)
    #[must_use]
    pub const fn codec(context: &'static str) -> Self {
        TransferError::Codec(Cow::Borrowed(context))
    }

    /// Create a checkpoint error with static context (zero allocation)
    #[must_use]
    pub const fn checkpoint(context: &'static str) -> Self {
        TransferError::Checkpoint(Cow::Borrowed(context))
    }

    /// Wrap an error raised while finalizing
    #[must_use]
    pub fn finalize(err: &TransferError) -> Self {
        match err {
            TransferError::Finalize(_) | TransferError::Cancelled => err.clone(),
            other => TransferError::Finalize(Cow::Owned(other.to_string())),
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Io(err.to_string())
    }
}

impl From<PlanError> for TransferError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::Io(msg) => TransferError::Io(msg),
            other => TransferError::Planning(Cow::Owned(other.to_string())),
        }
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(err: tokio::task::JoinError) -> Self {
        TransferError::Internal(Cow::Owned(format!("part worker failed: {err}")))
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Serialization(Cow::Owned(err.to_string()))
    }
}

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;
