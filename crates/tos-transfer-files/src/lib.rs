//! # tos-transfer files
//!
//! Payload-side primitives for the tos-transfer engine.
//!
//! This crate provides:
//! - Part planning for known-length resources and streamed payloads
//! - CRC-64/XZ integrity digests combinable across parts
//! - A staging-file collaborator for downloads (create, positional write, atomic rename)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checksum;
pub mod planner;
pub mod staging;

pub use checksum::{ChecksumAccumulator, PartChecksum, crc64, crc64_combine};
pub use planner::{
    ByteRange, PartPlanner, PlanError, PlannedRange, PlanningMode, RangePlan, StreamedPart,
    StreamedPlanner,
};
pub use staging::{LocalStagingFs, PartWriter, StagingFs, staging_path};

/// Default part size (20 MiB)
pub const DEFAULT_PART_SIZE: u64 = 20 * 1024 * 1024;

/// Smallest part size a planner will use (64 KiB)
pub const MIN_PART_SIZE: u64 = 64 * 1024;

/// Maximum number of parts in one multipart transfer
pub const MAX_PARTS: u64 = 10_000;

/// Suffix appended to a download destination while it is being written
pub const STAGING_SUFFIX: &str = ".temp";
