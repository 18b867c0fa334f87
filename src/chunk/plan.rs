//! Part planning
//!
//! Splits a payload of known size into contiguous, non-overlapping byte
//! ranges. Planning is pure and deterministic: identical inputs always give
//! identical plans, which is what lets a resumed download line its ranges up
//! with the sidecar written by an earlier attempt.

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};

/// Upper bound on parts per multipart upload accepted by common object stores
pub const MAX_PARTS: u64 = 10_000;

/// Half-open byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    /// First byte (inclusive)
    pub start: u64,
    /// One past the last byte
    pub end: u64,
}

impl ByteRange {
    /// Create a new range
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "inverted range {start}..{end}");
        Self { start, end }
    }

    /// Number of bytes in the range
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range is empty
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `other` lies entirely inside this range
    pub fn contains(&self, other: &ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// HTTP `Range` header value (inclusive end)
    pub fn to_http_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Derive a part size from the payload size and a concurrency hint
///
/// Aims for one part per worker, clamped to `[min_part_size, max_buffered]`
/// where `max_buffered` is the smaller of the buffering ceiling and
/// `max_part_size`. The result is then raised so the plan stays within
/// [`MAX_PARTS`], up to `max_part_size`.
pub fn part_size_for(
    total: u64,
    concurrency: usize,
    min_part_size: u64,
    max_part_size: u64,
    max_buffered_part_size: u64,
) -> u64 {
    let concurrency = concurrency.max(1) as u64;
    let min = min_part_size.max(1);
    let max = max_part_size.max(min);
    let buffered = max_buffered_part_size.min(max).max(min);

    let target = total.div_ceil(concurrency);
    let floor_for_limit = total.div_ceil(MAX_PARTS);

    target.clamp(min, buffered).max(floor_for_limit).min(max)
}

/// Split `[0, total)` into ranges of `part_size` bytes (last one shorter)
pub fn plan_parts(total: u64, part_size: u64) -> Result<Vec<ByteRange>> {
    if total == 0 {
        return Err(TransferError::precondition("cannot plan parts for an empty payload"));
    }
    if part_size == 0 {
        return Err(TransferError::precondition("part size must be greater than zero"));
    }

    let count = total.div_ceil(part_size);
    let ranges = (0..count)
        .map(|i| {
            let start = i * part_size;
            ByteRange::new(start, (start + part_size).min(total))
        })
        .collect();

    Ok(ranges)
}

/// A complete part plan for one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    /// Payload size
    pub total_size: u64,
    /// Size of every part except possibly the last
    pub part_size: u64,
    /// Ordered ranges
    pub ranges: Vec<ByteRange>,
}

impl PartPlan {
    /// Plan using the configured fixed part size, or derive one
    pub fn for_transfer(total_size: u64, concurrency: usize, config: &TransferConfig) -> Result<Self> {
        let part_size = config.part_size.unwrap_or_else(|| {
            part_size_for(
                total_size,
                concurrency,
                config.min_part_size,
                config.max_part_size,
                config.max_buffered_part_size,
            )
        });
        Self::with_part_size(total_size, part_size)
    }

    /// Plan with an explicit part size
    pub fn with_part_size(total_size: u64, part_size: u64) -> Result<Self> {
        if part_size > 0 && total_size.div_ceil(part_size) > MAX_PARTS {
            return Err(TransferError::precondition(format!(
                "{} bytes at part size {} needs {} parts (limit {})",
                total_size,
                part_size,
                total_size.div_ceil(part_size),
                MAX_PARTS
            )));
        }
        let ranges = plan_parts(total_size, part_size)?;
        Ok(Self {
            total_size,
            part_size,
            ranges,
        })
    }

    /// Number of parts
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether the plan has no parts (never true for a valid plan)
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_example_26_mib_at_10_mib() {
        let ranges = plan_parts(26 * MIB, 10 * MIB).unwrap();
        let lengths: Vec<u64> = ranges.iter().map(|r| r.len()).collect();
        assert_eq!(lengths, vec![10 * MIB, 10 * MIB, 6 * MIB]);
    }

    #[test]
    fn test_exact_multiple() {
        let ranges = plan_parts(30, 10).unwrap();
        assert_eq!(
            ranges,
            vec![ByteRange::new(0, 10), ByteRange::new(10, 20), ByteRange::new(20, 30)]
        );
    }

    #[test]
    fn test_zero_size_is_precondition() {
        assert!(matches!(plan_parts(0, 10), Err(TransferError::Precondition(_))));
        assert!(matches!(plan_parts(10, 0), Err(TransferError::Precondition(_))));
    }

    #[test]
    fn test_part_size_for_clamps() {
        // 100 MiB over 4 workers -> 25 MiB
        assert_eq!(part_size_for(100 * MIB, 4, 5 * MIB, 5 * 1024 * MIB, 64 * MIB), 25 * MIB);
        // small payload is clamped up to the minimum
        assert_eq!(part_size_for(MIB, 8, 5 * MIB, 5 * 1024 * MIB, 64 * MIB), 5 * MIB);
        // large payload is clamped down to the maximum
        assert_eq!(part_size_for(1024 * MIB, 1, MIB, 64 * MIB, 1024 * MIB), 64 * MIB);
    }

    #[test]
    fn test_part_size_for_respects_part_limit() {
        let total = 100_000 * MIB;
        let size = part_size_for(total, 100_000, MIB, 5 * 1024 * MIB, 64 * MIB);
        assert!(total.div_ceil(size) <= MAX_PARTS);
    }

    #[test]
    fn test_default_plan_bounds_part_buffers() {
        let config = TransferConfig::default();

        // One part per worker would be 5 GiB each
        let plan = PartPlan::for_transfer(40 * 1024 * MIB, 8, &config).unwrap();
        assert_eq!(plan.part_size, config.max_buffered_part_size);
        assert_eq!(plan.len(), 640);

        // Past MAX_PARTS * 64 MiB the part limit wins over the buffer ceiling
        let total = 1024 * 1024 * MIB;
        let plan = PartPlan::for_transfer(total, 8, &config).unwrap();
        assert!(plan.len() as u64 <= MAX_PARTS);
        assert!(plan.part_size <= config.max_part_size);
    }

    #[test]
    fn test_plan_rejects_too_many_parts() {
        assert!(PartPlan::with_part_size(MAX_PARTS + 1, 1).is_err());
        assert_eq!(PartPlan::with_part_size(MAX_PARTS, 1).unwrap().len(), MAX_PARTS as usize);
    }

    #[test]
    fn test_plan_limit_checked_before_allocating() {
        // A tampered sidecar could ask for a billion-range plan
        let err = PartPlan::with_part_size(1 << 50, 1).unwrap_err();
        assert!(matches!(err, TransferError::Precondition(_)));
        assert!(PartPlan::with_part_size(MIB, 0).is_err());
    }

    #[test]
    fn test_plan_uses_fixed_part_size() {
        let config = TransferConfig {
            part_size: Some(10 * MIB),
            ..Default::default()
        };
        let plan = PartPlan::for_transfer(26 * MIB, 4, &config).unwrap();
        assert_eq!(plan.part_size, 10 * MIB);
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn test_http_header() {
        assert_eq!(ByteRange::new(0, 10).to_http_header(), "bytes=0-9");
    }

    proptest! {
        #[test]
        fn prop_plan_covers_exactly(total in 1u64..5_000_000, part_size in 1u64..1_000_000) {
            let ranges = plan_parts(total, part_size).unwrap();

            prop_assert_eq!(ranges.len() as u64, total.div_ceil(part_size));
            prop_assert_eq!(ranges.first().unwrap().start, 0);
            prop_assert_eq!(ranges.last().unwrap().end, total);
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }
            for range in &ranges {
                prop_assert!(!range.is_empty());
                prop_assert!(range.len() <= part_size);
            }
            prop_assert_eq!(ranges.iter().map(|r| r.len()).sum::<u64>(), total);
        }

        #[test]
        fn prop_plan_is_deterministic(total in 1u64..1_000_000, part_size in 1u64..100_000) {
            prop_assert_eq!(plan_parts(total, part_size).unwrap(), plan_parts(total, part_size).unwrap());
        }
    }
}
