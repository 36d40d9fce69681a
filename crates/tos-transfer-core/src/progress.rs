//! Transfer progress snapshots
//!
//! Provides progress information for transfers, including speed and ETA.
//! Snapshots are produced by the scheduler's progress accumulator and
//! delivered to progress observers on the event bus.

use std::time::Duration;
use tokio::time::Instant;

/// Transfer status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Planning and checkpoint lookup
    Initializing,
    /// Parts in flight
    Transferring,
    /// All parts done, verifying and finalizing
    Finalizing,
    /// Transfer completed successfully
    Complete,
    /// Transfer failed with error
    Failed,
    /// Transfer cancelled by the caller
    Cancelled,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Transferring => write!(f, "Transferring"),
            Self::Finalizing => write!(f, "Finalizing"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Progress of one transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    /// Current status
    pub status: TransferStatus,

    /// Bytes moved so far (never decreases)
    pub consumed_bytes: u64,

    /// Total bytes, when known
    pub total_bytes: Option<u64>,

    /// Parts finished so far
    pub parts_done: usize,

    /// Total parts, when known
    pub parts_total: Option<usize>,

    /// Average speed since start in bytes/second
    pub speed_bytes_per_sec: f64,

    /// Estimated time remaining
    pub eta: Option<Duration>,

    /// Progress percentage (0.0 to 100.0)
    pub progress_percent: f64,
}

impl TransferProgress {
    /// Create an initial snapshot
    pub fn new(total_bytes: Option<u64>, parts_total: Option<usize>) -> Self {
        Self {
            status: TransferStatus::Initializing,
            consumed_bytes: 0,
            total_bytes,
            parts_done: 0,
            parts_total,
            speed_bytes_per_sec: 0.0,
            eta: None,
            progress_percent: 0.0,
        }
    }

    /// Update progress with current transfer state
    pub fn update(&mut self, consumed_bytes: u64, parts_done: usize, speed_bytes_per_sec: f64) {
        self.consumed_bytes = consumed_bytes;
        self.parts_done = parts_done;
        self.speed_bytes_per_sec = speed_bytes_per_sec;

        match self.total_bytes {
            Some(0) => self.progress_percent = 100.0,
            Some(total) => {
                self.progress_percent = (consumed_bytes as f64 / total as f64) * 100.0;
            }
            None => {}
        }

        self.eta = match self.total_bytes {
            Some(total) if speed_bytes_per_sec > 0.0 && consumed_bytes < total => {
                let remaining = (total - consumed_bytes) as f64;
                Some(Duration::from_secs_f64(remaining / speed_bytes_per_sec))
            }
            _ => None,
        };

        if self.status == TransferStatus::Initializing && consumed_bytes > 0 {
            self.status = TransferStatus::Transferring;
        }
    }

    /// Check if transfer is complete
    pub fn is_complete(&self) -> bool {
        matches!(self.status, TransferStatus::Complete)
    }

    /// Check if the transfer ended without completing
    pub fn is_failed(&self) -> bool {
        matches!(self.status, TransferStatus::Failed | TransferStatus::Cancelled)
    }

    /// Get human-readable ETA string
    pub fn eta_string(&self) -> String {
        match self.eta {
            Some(duration) => {
                let seconds = duration.as_secs();
                if seconds < 60 {
                    format!("{seconds}s")
                } else if seconds < 3600 {
                    format!("{}m {}s", seconds / 60, seconds % 60)
                } else {
                    format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
                }
            }
            None if self.is_complete() => "Complete".to_string(),
            None => "Calculating...".to_string(),
        }
    }

    /// Get human-readable speed string
    pub fn speed_string(&self) -> String {
        let speed = self.speed_bytes_per_sec;
        if speed < 1024.0 {
            format!("{speed:.2} B/s")
        } else if speed < 1024.0 * 1024.0 {
            format!("{:.2} KiB/s", speed / 1024.0)
        } else if speed < 1024.0 * 1024.0 * 1024.0 {
            format!("{:.2} MiB/s", speed / (1024.0 * 1024.0))
        } else {
            format!("{:.2} GiB/s", speed / (1024.0 * 1024.0 * 1024.0))
        }
    }
}

/// Tracks progress and average speed since a start instant
#[derive(Debug, Clone)]
pub struct ProgressMeter {
    progress: TransferProgress,
    started: Instant,
}

impl ProgressMeter {
    /// Start measuring now
    pub fn start(total_bytes: Option<u64>, parts_total: Option<usize>) -> Self {
        Self {
            progress: TransferProgress::new(total_bytes, parts_total),
            started: Instant::now(),
        }
    }

    /// Record new totals and return the resulting snapshot
    pub fn record(&mut self, consumed_bytes: u64, parts_done: usize) -> TransferProgress {
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            consumed_bytes as f64 / elapsed
        } else {
            0.0
        };
        self.progress.update(consumed_bytes, parts_done, speed);
        self.progress.clone()
    }

    /// Change the status and return the resulting snapshot
    pub fn set_status(&mut self, status: TransferStatus) -> TransferProgress {
        self.progress.status = status;
        if status == TransferStatus::Complete {
            self.progress.eta = None;
        }
        self.progress.clone()
    }

    /// Latest snapshot
    pub fn snapshot(&self) -> &TransferProgress {
        &self.progress
    }
}
