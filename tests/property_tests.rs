//! Property-based tests for tos-transfer
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Part Planning Properties
// ============================================================================

mod planning_properties {
    use super::*;
    use tos_transfer_files::{MAX_PARTS, MIN_PART_SIZE, PartPlanner, PlanningMode};

    proptest! {
        /// Planned ranges tile the payload exactly, in order, without gaps
        #[test]
        fn ranges_cover_payload(
            total in 0u64..(1u64 << 40),
            part_size in 1u64..(64 * 1024 * 1024),
        ) {
            let plan = PartPlanner::with_part_size(part_size).plan(total);

            prop_assert_eq!(plan.covered_bytes(), total);
            prop_assert!(plan.part_count() as u64 <= MAX_PARTS);
            prop_assert!(plan.part_size >= MIN_PART_SIZE);

            let mut next = 0u64;
            for (i, planned) in plan.ranges.iter().enumerate() {
                prop_assert_eq!(planned.index as usize, i);
                prop_assert_eq!(planned.range.start, next);
                prop_assert!(planned.range.len() <= plan.part_size);
                next = planned.range.end + 1;
            }
            prop_assert_eq!(next, total);

            if plan.part_count() > 1 {
                prop_assert_eq!(plan.mode, PlanningMode::Multipart);
                for planned in &plan.ranges[..plan.part_count() - 1] {
                    prop_assert_eq!(planned.range.len(), plan.part_size);
                }
            } else {
                prop_assert_eq!(plan.mode, PlanningMode::Simple);
            }
        }
    }
}

// ============================================================================
// Integrity Properties
// ============================================================================

mod checksum_properties {
    use super::*;
    use tos_transfer_files::{ChecksumAccumulator, crc64, crc64_combine};

    proptest! {
        /// Combining part CRCs equals the CRC of the concatenation
        #[test]
        fn combine_matches_concatenation(
            a in prop::collection::vec(any::<u8>(), 0..4096),
            b in prop::collection::vec(any::<u8>(), 0..4096),
        ) {
            let mut whole = a.clone();
            whole.extend_from_slice(&b);
            prop_assert_eq!(
                crc64_combine(crc64(&a), crc64(&b), b.len() as u64),
                crc64(&whole)
            );
        }

        /// Insertion order does not change the combined CRC
        #[test]
        fn accumulator_is_order_independent(
            data in prop::collection::vec(any::<u8>(), 1..16384),
            part_len in 1usize..2048,
            seed in any::<u64>(),
        ) {
            let parts: Vec<(u32, &[u8])> = data
                .chunks(part_len)
                .enumerate()
                .map(|(i, c)| (i as u32, c))
                .collect();

            let mut order: Vec<usize> = (0..parts.len()).collect();
            let mut state = seed;
            for i in (1..order.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                order.swap(i, (state >> 33) as usize % (i + 1));
            }

            let mut acc = ChecksumAccumulator::new();
            for &i in &order {
                let (index, chunk) = parts[i];
                acc.insert(index, crc64(chunk), chunk.len() as u64);
            }

            prop_assert!(acc.is_complete(parts.len()));
            prop_assert_eq!(acc.combined(), crc64(&data));
        }
    }
}

// ============================================================================
// Rate Limiter Properties
// ============================================================================

mod limiter_properties {
    use super::*;
    use std::time::Duration;
    use tos_transfer_core::RateLimiter;

    proptest! {
        /// Admitted bytes never exceed `rate * elapsed`, and every denied
        /// request is admitted after the advised wait
        #[test]
        fn throughput_bounded_by_rate(
            capacity in 10_240u64..1_048_576,
            rate in 1_024u64..4_194_304,
            wants in prop::collection::vec(1u64..2_097_152, 1..64),
        ) {
            let limiter = RateLimiter::new(capacity, rate);
            let start = limiter.state().last_refill;
            let mut now = start;
            let mut admitted = 0u64;

            for want in wants {
                let first = limiter.acquire_at(want, now);
                if !first.granted {
                    prop_assert!(first.wait > Duration::ZERO);
                    now += first.wait;
                    let second = limiter.acquire_at(want, now);
                    prop_assert!(second.granted);
                }
                admitted += want.min(limiter.capacity());

                let elapsed_ms = now.duration_since(start).as_millis();
                prop_assert!(
                    u128::from(admitted) * 1000 <= elapsed_ms * u128::from(rate),
                    "admitted {} bytes in {}ms at {} B/s",
                    admitted,
                    elapsed_ms,
                    rate
                );
            }

            prop_assert_eq!(limiter.metrics().bytes_granted, admitted);
        }
    }
}

// ============================================================================
// Progress Properties
// ============================================================================

mod progress_properties {
    use super::*;
    use tos_transfer_core::{DataTransferEvent, EventBus, ProgressMeter};

    proptest! {
        /// Non-decreasing totals give a non-decreasing percentage capped at 100
        #[test]
        fn percent_is_monotonic(
            steps in prop::collection::vec(0u64..65_536, 1..128),
        ) {
            let total: u64 = steps.iter().sum();
            let mut meter = ProgressMeter::start(Some(total), Some(steps.len()));
            let mut consumed = 0u64;
            let mut last_percent = 0.0f64;

            for (i, step) in steps.iter().enumerate() {
                consumed += step;
                let snapshot = meter.record(consumed, i + 1);
                prop_assert_eq!(snapshot.consumed_bytes, consumed);
                prop_assert!(snapshot.progress_percent >= last_percent);
                prop_assert!(snapshot.progress_percent <= 100.0);
                last_percent = snapshot.progress_percent;
            }
            prop_assert!((last_percent - 100.0).abs() < 1e-9);
        }

        /// Nothing is delivered after a terminal event
        #[test]
        fn bus_sealed_after_terminal(
            before in 0usize..16,
            after in 0usize..16,
            outcome in 0u8..3,
        ) {
            let bus = EventBus::new();
            let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
            let sink = std::sync::Arc::clone(&seen);
            bus.subscribe_data(move |e: &DataTransferEvent| sink.lock().push(e.clone()));

            let rw = |n: u64| DataTransferEvent::Rw {
                rw_once_bytes: 1,
                consumed_bytes: n,
                total_bytes: None,
            };
            for n in 0..before {
                prop_assert!(bus.emit_data(rw(n as u64)));
            }
            let terminal = match outcome {
                0 => DataTransferEvent::Succeed { total_bytes: before as u64 },
                1 => DataTransferEvent::Failed {
                    error: tos_transfer_core::TransferError::transient("reset"),
                },
                _ => DataTransferEvent::Cancelled,
            };
            prop_assert!(bus.emit_data(terminal.clone()));
            for n in 0..after {
                prop_assert!(!bus.emit_data(rw(n as u64)));
            }
            prop_assert!(!bus.emit_data(DataTransferEvent::Cancelled));

            let seen = seen.lock();
            prop_assert_eq!(seen.len(), before + 1);
            prop_assert_eq!(seen.last(), Some(&terminal));
        }
    }
}
