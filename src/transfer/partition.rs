//! Part sizing and byte-range enumeration.
//!
//! The same algorithm serves uploads, migrations and chunked downloads; only
//! the [`PartLimits`] differ.

use std::ops::Range;

use crate::storage::ByteRange;

/// Bounds applied when choosing a part size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartLimits {
    /// Maximum number of parts; 0 is treated as 1.
    pub max_parts: u64,
    /// Minimum part size in bytes.
    pub min_part_size: u64,
}

impl PartLimits {
    /// Creates part limits.
    #[must_use]
    pub fn new(max_parts: u64, min_part_size: u64) -> Self {
        Self {
            max_parts,
            min_part_size,
        }
    }

    /// Part size for an object of `length` bytes under these limits.
    #[must_use]
    pub fn part_size(&self, length: u64) -> u64 {
        compute_part_size(length, self.max_parts, self.min_part_size)
    }

    /// Plans the parts of an object of `length` bytes.
    #[must_use]
    pub fn plan(&self, length: u64) -> Vec<PartDescriptor> {
        plan_parts(length, self.part_size(length))
    }
}

/// Returns `max(ceil(length / max_parts), min_part_size)`, never 0.
///
/// # Examples
///
/// ```
/// use objstore_core::transfer::compute_part_size;
///
/// const MIB: u64 = 1024 * 1024;
/// assert_eq!(compute_part_size(25 * MIB, 10_000, 10 * MIB), 10 * MIB);
/// assert_eq!(compute_part_size(100, 3, 1), 34);
/// ```
#[must_use]
pub fn compute_part_size(length: u64, max_parts: u64, min_part_size: u64) -> u64 {
    let per_part = length.div_ceil(max_parts.max(1));
    per_part.max(min_part_size).max(1)
}

/// One contiguous slice of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 1-based part number.
    pub number: u32,
    /// First byte offset.
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
}

impl PartDescriptor {
    /// Bytes covered by this part.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Half-open offset range.
    #[must_use]
    pub fn range(&self) -> Range<u64> {
        self.start..self.end + 1
    }

    /// Inclusive range for a `Range` header.
    #[must_use]
    pub fn byte_range(&self) -> ByteRange {
        ByteRange::new(self.start, self.end)
    }

    /// 0-based index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.number as usize - 1
    }
}

/// Splits `length` bytes into parts of `part_size` (the last may be shorter).
///
/// Returns no parts for a zero length.
#[must_use]
pub fn plan_parts(length: u64, part_size: u64) -> Vec<PartDescriptor> {
    plan_parts_from(0, length, part_size)
}

/// Like [`plan_parts`] with every offset shifted by `base`.
#[must_use]
pub fn plan_parts_from(base: u64, length: u64, part_size: u64) -> Vec<PartDescriptor> {
    let part_size = part_size.max(1);
    let mut parts = Vec::with_capacity(usize::try_from(length.div_ceil(part_size)).unwrap_or(0));
    let mut offset = 0u64;
    let mut number = 1u32;
    while offset < length {
        let size = part_size.min(length - offset);
        parts.push(PartDescriptor {
            number,
            start: base + offset,
            end: base + offset + size - 1,
        });
        offset += size;
        number += 1;
    }
    parts
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_compute_part_size_respects_minimum() {
        assert_eq!(compute_part_size(1, 10_000, 10 * MIB), 10 * MIB);
        assert_eq!(compute_part_size(0, 10_000, 5 * MIB), 5 * MIB);
    }

    #[test]
    fn test_compute_part_size_respects_max_parts() {
        let length = 200_000 * MIB;
        let size = compute_part_size(length, 10_000, 10 * MIB);
        assert_eq!(size, 20 * MIB);
        assert!(length.div_ceil(size) <= 10_000);
    }

    #[test]
    fn test_compute_part_size_zero_max_parts_is_one() {
        assert_eq!(compute_part_size(100, 0, 1), 100);
    }

    #[test]
    fn test_part_size_bounds_hold_across_lengths() {
        for length in [1, 7, MIB, 25 * MIB + 3, 1_000 * MIB] {
            for max_parts in [1, 3, 10_000] {
                let size = compute_part_size(length, max_parts, MIB);
                assert!(size >= MIB);
                assert!(length.div_ceil(size) <= max_parts);
            }
        }
    }

    #[test]
    fn test_plan_parts_covers_length_exactly() {
        let parts = plan_parts(25 * MIB, 10 * MIB);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.iter().map(PartDescriptor::size).sum::<u64>(), 25 * MIB);
        assert_eq!(parts[2].size(), 5 * MIB);
        assert_eq!(
            parts.iter().map(|p| p.number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }
    }

    #[test]
    fn test_plan_parts_empty_and_single() {
        assert!(plan_parts(0, 10).is_empty());
        let single = plan_parts(1, 10);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].range(), 0..1);
    }

    #[test]
    fn test_plan_parts_from_shifts_offsets() {
        let parts = plan_parts_from(1000, 25, 10);
        assert_eq!(parts[0].byte_range(), ByteRange::new(1000, 1009));
        assert_eq!(parts[2].byte_range(), ByteRange::new(1020, 1024));
        assert_eq!(parts[2].index(), 2);
    }

    #[test]
    fn test_part_limits_plan() {
        let limits = PartLimits::new(10_000, 10 * MIB);
        let parts = limits.plan(10 * MIB);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].size(), 10 * MIB);
    }
}
