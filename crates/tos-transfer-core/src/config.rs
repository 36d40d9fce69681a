//! Transfer configuration
//!
//! Every field has a default, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! part_size = 8388608
//! concurrency = 8
//!
//! [rate_limit]
//! capacity_bytes = 1048576
//! refill_rate_per_second = 1048576
//!
//! [retry]
//! max_retries = 5
//! ```

use crate::error::{Result, TransferError};
use crate::rate_limiter::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tos_transfer_files::{DEFAULT_PART_SIZE, MIN_PART_SIZE};

/// Default number of simultaneous part operations
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default chunk size for rate limiting and progress (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default per-attempt request timeout
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Configuration for one upload or download
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Part size in bytes
    pub part_size: u64,

    /// Maximum simultaneous in-flight part operations
    pub concurrency: usize,

    /// Bytes admitted through the rate limiter per step
    pub chunk_size: usize,

    /// Time budget of a single request attempt
    pub request_timeout_ms: u64,

    /// Verify CRC-64 end to end
    pub enable_crc: bool,

    /// Directory for on-disk checkpoints (None keeps checkpoints in memory)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,

    /// Throughput limit (None means unthrottled)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    /// Retry policy
    pub retry: RetryPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            enable_crc: true,
            checkpoint_dir: None,
            rate_limit: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl TransferConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        tracing::debug!("Loaded transfer config from {}", path.display());
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TransferConfig = toml::from_str(content).map_err(|e| {
            TransferError::InvalidConfig(Cow::Owned(format!("failed to parse config: {e}")))
        })?;
        config.validate()
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TransferError::Serialization(Cow::Owned(e.to_string())))
    }

    /// Check invariants, raising values that sit below their floors
    pub fn validate(mut self) -> Result<Self> {
        if self.concurrency == 0 {
            return Err(TransferError::InvalidConfig(Cow::Borrowed(
                "concurrency must be at least 1",
            )));
        }
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidConfig(Cow::Borrowed(
                "chunk_size must be non-zero",
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(TransferError::InvalidConfig(Cow::Borrowed(
                "request_timeout_ms must be non-zero",
            )));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(TransferError::InvalidConfig(Cow::Borrowed(
                "retry.multiplier must be >= 1.0",
            )));
        }

        if self.part_size < MIN_PART_SIZE {
            tracing::debug!(
                "Raising part_size {} to minimum {}",
                self.part_size,
                MIN_PART_SIZE
            );
            self.part_size = MIN_PART_SIZE;
        }
        self.retry.max_finalize_attempts = self.retry.max_finalize_attempts.max(1);

        Ok(self)
    }

    /// Per-attempt request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt of a part
    pub max_retries: u32,

    /// Initial backoff in milliseconds
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add up to 25% random jitter
    pub jitter: bool,

    /// Status codes treated as transient
    pub retryable_statuses: Vec<u16>,

    /// Attempts for the finalize step (complete or rename)
    pub max_finalize_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            retryable_statuses: vec![429, 500, 502, 503, 504],
            max_finalize_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            max_finalize_attempts: 1,
            ..Self::default()
        }
    }

    /// Total attempts per part
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether a response status should be retried
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Calculate backoff duration before retry number `attempt` (zero-based)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64);

        let millis = if self.jitter {
            use rand::Rng;
            let jitter_factor = rand::thread_rng().gen_range(0..25) as f64 / 100.0;
            capped * (1.0 + jitter_factor)
        } else {
            capped
        };

        Duration::from_millis(millis as u64)
    }
}
