//! Parts and transfer plans
//!
//! A [`Part`] moves only forward: `Pending -> InFlight -> Done`, or
//! `InFlight -> Failed -> Pending` when it is retried. Its range never
//! changes once planned.

use crate::checkpoint::{Checkpoint, PartRecord, TransferFingerprint};
use tos_transfer_files::{ByteRange, PlannedRange, PlanningMode, RangePlan};

/// Part state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    /// Waiting for a worker
    Pending,
    /// An attempt is running
    InFlight,
    /// Transferred and recorded
    Done,
    /// Last attempt failed
    Failed,
}

/// Unit of scheduling and retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Zero-based index, unique within the transfer
    pub index: u32,
    /// Bytes covered
    pub range: ByteRange,
    state: PartState,
    etag: Option<String>,
    crc64: Option<u64>,
    attempts: u32,
}

impl Part {
    /// Create a pending part
    pub fn new(index: u32, range: ByteRange) -> Self {
        Self {
            index,
            range,
            state: PartState::Pending,
            etag: None,
            crc64: None,
            attempts: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> PartState {
        self.state
    }

    /// Attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Per-part integrity token
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// CRC-64 of the part contents
    pub fn crc64(&self) -> Option<u64> {
        self.crc64
    }

    /// Part length
    pub fn len(&self) -> u64 {
        self.range.len()
    }

    /// Parts are never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    /// One-based part number used on the wire
    pub fn part_number(&self) -> u32 {
        self.index + 1
    }

    /// `Pending -> InFlight`, counting an attempt
    pub fn start_attempt(&mut self) -> bool {
        if self.state != PartState::Pending {
            return false;
        }
        self.state = PartState::InFlight;
        self.attempts += 1;
        true
    }

    /// `InFlight -> Done`
    pub fn complete(&mut self, etag: Option<String>, crc64: Option<u64>) -> bool {
        if self.state != PartState::InFlight {
            return false;
        }
        self.state = PartState::Done;
        self.etag = etag;
        self.crc64 = crc64;
        true
    }

    /// `InFlight -> Failed`
    pub fn fail(&mut self) -> bool {
        if self.state != PartState::InFlight {
            return false;
        }
        self.state = PartState::Failed;
        true
    }

    /// `Failed -> Pending`
    pub fn retry(&mut self) -> bool {
        if self.state != PartState::Failed {
            return false;
        }
        self.state = PartState::Pending;
        true
    }

    /// `Pending -> Done` from a checkpoint record
    pub fn restore(&mut self, record: &PartRecord) -> bool {
        if self.state != PartState::Pending || record.size != self.len() {
            return false;
        }
        self.state = PartState::Done;
        self.etag = record.etag.clone();
        self.crc64 = record.crc64;
        true
    }

    /// Record for the checkpoint store
    pub fn record(&self) -> PartRecord {
        PartRecord {
            etag: self.etag.clone(),
            crc64: self.crc64,
            size: self.len(),
        }
    }
}

impl From<PlannedRange> for Part {
    fn from(planned: PlannedRange) -> Self {
        Part::new(planned.index, planned.range)
    }
}

/// The parts of one transfer
///
/// Owned by a single scheduler run.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    /// Transfer identity
    pub fingerprint: TransferFingerprint,
    /// Ordered parts (empty for streamed plans, which are fed lazily)
    pub parts: Vec<Part>,
    /// Part size
    pub part_size: u64,
    /// Payload length, `None` while unknown
    pub total_bytes: Option<u64>,
    /// Simple or multipart
    pub mode: PlanningMode,
}

impl TransferPlan {
    /// Build a plan from planned ranges
    pub fn from_ranges(fingerprint: TransferFingerprint, ranges: RangePlan) -> Self {
        Self {
            fingerprint,
            parts: ranges.ranges.into_iter().map(Part::from).collect(),
            part_size: ranges.part_size,
            total_bytes: Some(ranges.total_bytes),
            mode: ranges.mode,
        }
    }

    /// Plan for a stream of unknown length
    pub fn streamed(fingerprint: TransferFingerprint, part_size: u64) -> Self {
        Self {
            fingerprint,
            parts: Vec::new(),
            part_size,
            total_bytes: None,
            mode: PlanningMode::Multipart,
        }
    }

    /// Number of planned parts
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Mark parts recorded in `checkpoint` as done; returns how many were restored
    ///
    /// Records whose size does not match the planned part are ignored.
    pub fn apply_checkpoint(&mut self, checkpoint: &Checkpoint) -> usize {
        let mut restored = 0;
        for part in &mut self.parts {
            if let Some(record) = checkpoint.completed_parts.get(&part.index) {
                if part.restore(record) {
                    restored += 1;
                }
            }
        }
        restored
    }

    /// Parts still to transfer
    pub fn pending(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter(|p| p.state() != PartState::Done)
    }

    /// Bytes covered by done parts
    pub fn done_bytes(&self) -> u64 {
        self.parts
            .iter()
            .filter(|p| p.state() == PartState::Done)
            .map(Part::len)
            .sum()
    }

    /// Whether every part is done
    pub fn is_complete(&self) -> bool {
        self.parts.iter().all(|p| p.state() == PartState::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Direction;
    use tos_transfer_files::PartPlanner;

    fn range(start: u64, end: u64) -> ByteRange {
        ByteRange::new(start, end).unwrap()
    }

    #[test]
    fn test_forward_transitions() {
        let mut part = Part::new(0, range(0, 9));
        assert!(!part.complete(None, None));

        assert!(part.start_attempt());
        assert!(!part.start_attempt());
        assert!(part.fail());
        assert!(!part.start_attempt());
        assert!(part.retry());
        assert!(part.start_attempt());
        assert_eq!(part.attempts(), 2);

        assert!(part.complete(Some("e".into()), Some(7)));
        assert_eq!(part.state(), PartState::Done);
        assert!(!part.fail());
        assert!(!part.retry());
        assert_eq!(part.record().size, 10);
        assert_eq!(part.part_number(), 1);
    }

    #[test]
    fn test_apply_checkpoint() {
        let fp = TransferFingerprint::new(Direction::Download, "b/k", Some(300), "etag");
        let ranges = PartPlanner::with_part_size(128 * 1024).plan(300 * 1024);
        let mut plan = TransferPlan::from_ranges(fp.clone(), ranges);
        assert_eq!(plan.part_count(), 3);

        let mut checkpoint = Checkpoint::new(fp, plan.part_size);
        checkpoint.mark_part_done(
            1,
            PartRecord {
                etag: None,
                crc64: Some(1),
                size: 128 * 1024,
            },
        );
        // Size disagrees with the planned part
        checkpoint.mark_part_done(
            2,
            PartRecord {
                etag: None,
                crc64: Some(2),
                size: 1,
            },
        );

        assert_eq!(plan.apply_checkpoint(&checkpoint), 1);
        assert_eq!(plan.done_bytes(), 128 * 1024);
        assert_eq!(plan.pending().map(|p| p.index).collect::<Vec<_>>(), vec![0, 2]);
        assert!(!plan.is_complete());
    }
}
