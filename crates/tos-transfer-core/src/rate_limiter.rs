//! Byte-throughput rate limiting
//!
//! Token bucket admission control shared by every worker of a transfer (or
//! by several transfers when the caller hands out one limiter). The limiter
//! never blocks: [`RateLimiter::acquire`] either grants or reports how long
//! to wait, and [`RateLimiter::wait_for`] implements the caller-side
//! sleep-and-retry loop.

use crate::cancel::CancellationToken;
use crate::error::{Result, TransferError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Smallest bucket capacity (10 KiB)
pub const MIN_CAPACITY_BYTES: u64 = 10 * 1024;

/// Smallest refill rate (1 KiB/s)
pub const MIN_REFILL_RATE: u64 = 1024;

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Bucket capacity in bytes
    pub capacity_bytes: u64,

    /// Bytes added per second
    pub refill_rate_per_second: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 10 * 1024 * 1024,         // 10 MiB burst
            refill_rate_per_second: 10 * 1024 * 1024, // 10 MiB/s
        }
    }
}

/// Outcome of one admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquire {
    /// Tokens were consumed
    pub granted: bool,

    /// Time until enough tokens exist (zero when granted)
    pub wait: Duration,
}

impl Acquire {
    /// Wait in whole milliseconds
    pub fn wait_millis(&self) -> u64 {
        self.wait.as_millis() as u64
    }
}

/// Token bucket state
#[derive(Debug, Clone)]
pub struct RateLimiterState {
    /// Maximum tokens
    pub capacity_bytes: u64,

    /// Tokens added per second
    pub refill_rate_per_second: u64,

    /// Tokens available at `last_refill`
    pub available_tokens: u64,

    /// Time of the last grant
    pub last_refill: Instant,
}

/// Rate limiting metrics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RateLimitMetrics {
    /// Calls that consumed tokens
    pub granted: u64,

    /// Calls told to wait
    pub denied: u64,

    /// Total bytes admitted
    pub bytes_granted: u64,
}

struct Bucket {
    state: RateLimiterState,
    metrics: RateLimitMetrics,
}

/// Token bucket rate limiter
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter; values below the floors are raised silently
    ///
    /// The bucket starts empty.
    pub fn new(capacity_bytes: u64, refill_rate_per_second: u64) -> Self {
        let state = RateLimiterState {
            capacity_bytes: capacity_bytes.max(MIN_CAPACITY_BYTES),
            refill_rate_per_second: refill_rate_per_second.max(MIN_REFILL_RATE),
            available_tokens: 0,
            last_refill: Instant::now(),
        };

        tracing::debug!(
            "Rate limiter: capacity={} bytes, rate={} bytes/s",
            state.capacity_bytes,
            state.refill_rate_per_second
        );

        Self {
            bucket: Mutex::new(Bucket {
                state,
                metrics: RateLimitMetrics::default(),
            }),
        }
    }

    /// Create a limiter from configuration
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity_bytes, config.refill_rate_per_second)
    }

    /// Request admission for `want` bytes now
    pub fn acquire(&self, want: u64) -> Acquire {
        self.acquire_at(want, Instant::now())
    }

    /// Request admission for `want` bytes at a given instant
    ///
    /// `want` is clamped to the capacity. Tokens accumulate as
    /// `floor(elapsed_ms * rate / 1000)`, capped at the capacity.
    pub fn acquire_at(&self, want: u64, now: Instant) -> Acquire {
        let mut bucket = self.bucket.lock();
        let state = &mut bucket.state;

        let want = want.min(state.capacity_bytes);
        let elapsed_ms = now.saturating_duration_since(state.last_refill).as_millis();
        let accumulated = (elapsed_ms * u128::from(state.refill_rate_per_second) / 1000)
            .min(u128::from(state.capacity_bytes)) as u64;
        let available = state
            .available_tokens
            .saturating_add(accumulated)
            .min(state.capacity_bytes);

        if available >= want {
            state.available_tokens = available - want;
            state.last_refill = now;
            bucket.metrics.granted += 1;
            bucket.metrics.bytes_granted += want;
            Acquire {
                granted: true,
                wait: Duration::ZERO,
            }
        } else {
            let missing = u128::from(want - available);
            let rate = u128::from(state.refill_rate_per_second);
            let wait_ms = (missing * 1000).div_ceil(rate) as u64;
            bucket.metrics.denied += 1;
            Acquire {
                granted: false,
                wait: Duration::from_millis(wait_ms),
            }
        }
    }

    /// Sleep and re-acquire until `want` bytes are admitted
    ///
    /// Returns [`TransferError::Cancelled`] if the token fires while waiting.
    pub async fn wait_for(&self, want: u64, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let outcome = self.acquire(want);
            if outcome.granted {
                return Ok(());
            }

            tracing::trace!("Rate limited: waiting {}ms for {} bytes", outcome.wait_millis(), want);
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(outcome.wait) => {}
            }
        }
    }

    /// Bucket capacity after floors
    pub fn capacity(&self) -> u64 {
        self.bucket.lock().state.capacity_bytes
    }

    /// Snapshot of the bucket
    pub fn state(&self) -> RateLimiterState {
        self.bucket.lock().state.clone()
    }

    /// Current metrics
    pub fn metrics(&self) -> RateLimitMetrics {
        self.bucket.lock().metrics.clone()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bucket = self.bucket.lock();
        f.debug_struct("RateLimiter")
            .field("capacity_bytes", &bucket.state.capacity_bytes)
            .field("refill_rate_per_second", &bucket.state.refill_rate_per_second)
            .field("available_tokens", &bucket.state.available_tokens)
            .finish()
    }
}
