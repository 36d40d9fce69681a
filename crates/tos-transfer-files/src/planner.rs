//! Part planning.
//!
//! Divides a payload into ordered, addressable parts. Known-length resources
//! are planned up front; streams of unknown length are planned lazily, one
//! read-ahead buffer at a time.

use crate::{DEFAULT_PART_SIZE, MAX_PARTS, MIN_PART_SIZE};
use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Planning errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// Range end precedes its start
    #[error("inverted byte range: {start}-{end}")]
    InvertedRange {
        /// Range start
        start: u64,
        /// Range end (inclusive)
        end: u64,
    },

    /// Part index outside the plan
    #[error("part index {index} out of range (plan has {count} parts)")]
    IndexOutOfRange {
        /// Requested index
        index: u32,
        /// Number of planned parts
        count: usize,
    },

    /// Streamed payload exceeds the part limit
    #[error("payload needs more than {MAX_PARTS} parts at part size {part_size}")]
    TooManyParts {
        /// Part size in use
        part_size: u64,
    },

    /// Reading the streamed payload failed
    #[error("read failed: {0}")]
    Io(String),
}

/// Inclusive byte range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    /// First byte offset
    pub start: u64,
    /// Last byte offset (inclusive)
    pub end: u64,
}

impl ByteRange {
    /// Create a range, rejecting `end < start`
    pub fn new(start: u64, end: u64) -> Result<Self, PlanError> {
        if end < start {
            return Err(PlanError::InvertedRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Number of bytes covered
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// A byte range always covers at least one byte
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// `Range` header value for this range
    #[must_use]
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// A range together with its position in the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRange {
    /// Zero-based part index
    pub index: u32,
    /// Bytes covered by the part
    pub range: ByteRange,
}

/// How a planned payload is moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanningMode {
    /// One plain request (empty or single-part payloads)
    Simple,
    /// Multipart transfer
    Multipart,
}

/// Result of planning a known-length payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangePlan {
    /// Part size actually used
    pub part_size: u64,
    /// Payload length
    pub total_bytes: u64,
    /// Transfer mode
    pub mode: PlanningMode,
    /// Ordered parts
    pub ranges: Vec<PlannedRange>,
}

impl RangePlan {
    /// Number of parts
    #[must_use]
    pub fn part_count(&self) -> usize {
        self.ranges.len()
    }

    /// Look up the range of a part
    pub fn range_of(&self, index: u32) -> Result<ByteRange, PlanError> {
        self.ranges
            .get(index as usize)
            .map(|p| p.range)
            .ok_or(PlanError::IndexOutOfRange {
                index,
                count: self.ranges.len(),
            })
    }

    /// Sum of all part lengths
    #[must_use]
    pub fn covered_bytes(&self) -> u64 {
        self.ranges.iter().map(|p| p.range.len()).sum()
    }
}

/// Splits payloads into fixed-size parts
#[derive(Debug, Clone, Copy)]
pub struct PartPlanner {
    part_size: u64,
}

impl PartPlanner {
    /// Create a planner with the default part size
    pub fn new() -> Self {
        Self::with_part_size(DEFAULT_PART_SIZE)
    }

    /// Create a planner with a custom part size, raised to [`MIN_PART_SIZE`] if smaller
    pub fn with_part_size(size: u64) -> Self {
        Self {
            part_size: size.max(MIN_PART_SIZE),
        }
    }

    /// Configured part size
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Part size used for a payload of `total_bytes`, raised so the plan fits in [`MAX_PARTS`]
    pub fn effective_part_size(&self, total_bytes: u64) -> u64 {
        self.part_size.max(total_bytes.div_ceil(MAX_PARTS))
    }

    /// Number of parts for a payload of `total_bytes`
    pub fn part_count(&self, total_bytes: u64) -> u64 {
        total_bytes.div_ceil(self.effective_part_size(total_bytes))
    }

    /// Plan a known-length payload
    pub fn plan(&self, total_bytes: u64) -> RangePlan {
        let part_size = self.effective_part_size(total_bytes);

        if total_bytes == 0 {
            return RangePlan {
                part_size,
                total_bytes,
                mode: PlanningMode::Simple,
                ranges: Vec::new(),
            };
        }

        let mut ranges = Vec::with_capacity(total_bytes.div_ceil(part_size) as usize);
        let mut start = 0u64;
        let mut index = 0u32;
        while start < total_bytes {
            let end = start.saturating_add(part_size).min(total_bytes) - 1;
            ranges.push(PlannedRange {
                index,
                range: ByteRange { start, end },
            });
            start = end + 1;
            index += 1;
        }

        let mode = if ranges.len() == 1 {
            PlanningMode::Simple
        } else {
            PlanningMode::Multipart
        };

        tracing::debug!(
            "Planned {} bytes into {} parts of {} bytes ({:?})",
            total_bytes,
            ranges.len(),
            part_size,
            mode
        );

        RangePlan {
            part_size,
            total_bytes,
            mode,
            ranges,
        }
    }
}

impl Default for PartPlanner {
    fn default() -> Self {
        Self::new()
    }
}

/// One buffered part of a streamed payload
#[derive(Debug, Clone)]
pub struct StreamedPart {
    /// Zero-based part index
    pub index: u32,
    /// Offset of the first byte in the stream
    pub offset: u64,
    /// Part contents
    pub data: Bytes,
    /// Set when the read that produced this part came up short
    pub last: bool,
}

/// Lazily plans an unknown-length stream
///
/// Each call to [`next_part`](Self::next_part) fills one buffer of
/// `part_size` bytes. A short fill marks the last part; an empty fill ends
/// the stream.
pub struct StreamedPlanner<R> {
    reader: R,
    part_size: u64,
    next_index: u32,
    offset: u64,
    finished: bool,
}

impl<R: AsyncRead + Unpin> StreamedPlanner<R> {
    /// Create a streamed planner, raising `part_size` to [`MIN_PART_SIZE`] if smaller
    pub fn new(reader: R, part_size: u64) -> Self {
        Self {
            reader,
            part_size: part_size.max(MIN_PART_SIZE),
            next_index: 0,
            offset: 0,
            finished: false,
        }
    }

    /// Part size in use
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.offset
    }

    /// Number of parts produced so far
    pub fn parts_produced(&self) -> u32 {
        self.next_index
    }

    /// Read the next part, or `None` once the stream is exhausted
    pub async fn next_part(&mut self) -> Result<Option<StreamedPart>, PlanError> {
        if self.finished {
            return Ok(None);
        }

        let part_size = self.part_size as usize;
        let mut buf = vec![0u8; part_size];
        let mut filled = 0;
        while filled < part_size {
            let n = self
                .reader
                .read(&mut buf[filled..])
                .await
                .map_err(|e| PlanError::Io(e.to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);

        if filled == 0 {
            self.finished = true;
            return Ok(None);
        }

        if u64::from(self.next_index) >= MAX_PARTS {
            return Err(PlanError::TooManyParts {
                part_size: self.part_size,
            });
        }

        let last = filled < part_size;
        if last {
            self.finished = true;
        }

        let part = StreamedPart {
            index: self.next_index,
            offset: self.offset,
            data: Bytes::from(buf),
            last,
        };

        tracing::trace!(
            "Streamed part {} at offset {} ({} bytes, last={})",
            part.index,
            part.offset,
            filled,
            last
        );

        self.next_index += 1;
        self.offset += filled as u64;
        Ok(Some(part))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_plan_ten_parts() {
        let plan = PartPlanner::with_part_size(MIB).plan(10 * MIB);

        assert_eq!(plan.part_count(), 10);
        assert_eq!(plan.mode, PlanningMode::Multipart);
        assert_eq!(plan.covered_bytes(), 10 * MIB);
        assert_eq!(plan.ranges[0].range, ByteRange { start: 0, end: MIB - 1 });
        assert_eq!(plan.ranges[9].range.end, 10 * MIB - 1);
    }

    #[test]
    fn test_plan_remainder_in_last_part() {
        let plan = PartPlanner::with_part_size(MIB).plan(2 * MIB + 10);

        assert_eq!(plan.part_count(), 3);
        assert_eq!(plan.ranges[2].range.len(), 10);
        assert_eq!(plan.covered_bytes(), 2 * MIB + 10);
    }

    #[test]
    fn test_plan_single_part_is_simple() {
        let planner = PartPlanner::with_part_size(MIB);

        let exact = planner.plan(MIB);
        assert_eq!(exact.mode, PlanningMode::Simple);
        assert_eq!(exact.part_count(), 1);

        let small = planner.plan(1);
        assert_eq!(small.mode, PlanningMode::Simple);
        assert_eq!(small.ranges[0].range, ByteRange { start: 0, end: 0 });
    }

    #[test]
    fn test_plan_empty() {
        let plan = PartPlanner::new().plan(0);
        assert_eq!(plan.mode, PlanningMode::Simple);
        assert!(plan.ranges.is_empty());
        assert_eq!(plan.covered_bytes(), 0);
    }

    #[test]
    fn test_part_size_floor() {
        let planner = PartPlanner::with_part_size(1);
        assert_eq!(planner.part_size(), MIN_PART_SIZE);
    }

    #[test]
    fn test_part_limit_raises_part_size() {
        let planner = PartPlanner::with_part_size(MIN_PART_SIZE);
        let total = MIN_PART_SIZE * MAX_PARTS * 2;

        assert_eq!(planner.effective_part_size(total), MIN_PART_SIZE * 2);
        assert_eq!(planner.part_count(total), MAX_PARTS);
    }

    #[test]
    fn test_range_of() {
        let plan = PartPlanner::with_part_size(MIB).plan(3 * MIB);
        assert_eq!(plan.range_of(1).unwrap().start, MIB);
        assert_eq!(
            plan.range_of(3),
            Err(PlanError::IndexOutOfRange { index: 3, count: 3 })
        );
    }

    #[test]
    fn test_byte_range() {
        let range = ByteRange::new(100, 199).unwrap();
        assert_eq!(range.len(), 100);
        assert_eq!(range.to_header(), "bytes=100-199");
        assert_eq!(range.to_string(), "100-199");
        assert!(ByteRange::new(5, 4).is_err());
    }

    #[tokio::test]
    async fn test_streamed_short_last_part() {
        let data = vec![7u8; (MIN_PART_SIZE * 2 + 5) as usize];
        let mut planner = StreamedPlanner::new(&data[..], MIN_PART_SIZE);

        let first = planner.next_part().await.unwrap().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.data.len() as u64, MIN_PART_SIZE);
        assert!(!first.last);

        let second = planner.next_part().await.unwrap().unwrap();
        assert_eq!(second.offset, MIN_PART_SIZE);
        assert!(!second.last);

        let third = planner.next_part().await.unwrap().unwrap();
        assert_eq!(third.data.len(), 5);
        assert!(third.last);

        assert!(planner.next_part().await.unwrap().is_none());
        assert_eq!(planner.bytes_read(), data.len() as u64);
    }

    #[tokio::test]
    async fn test_streamed_exact_multiple() {
        let data = vec![1u8; (MIN_PART_SIZE * 2) as usize];
        let mut planner = StreamedPlanner::new(&data[..], MIN_PART_SIZE);

        assert!(planner.next_part().await.unwrap().is_some());
        assert!(planner.next_part().await.unwrap().is_some());
        assert!(planner.next_part().await.unwrap().is_none());
        assert_eq!(planner.parts_produced(), 2);
    }

    #[tokio::test]
    async fn test_streamed_empty() {
        let data: &[u8] = &[];
        let mut planner = StreamedPlanner::new(data, MIN_PART_SIZE);
        assert!(planner.next_part().await.unwrap().is_none());
        assert_eq!(planner.parts_produced(), 0);
    }
}
