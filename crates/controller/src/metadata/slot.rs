//! Slot ranges
//!
//! The slot space is fixed at 16384 hash slots. Shards own a set of
//! disjoint, inclusive ranges over it.

use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, Result};

/// Total number of hash slots (same as Redis Cluster)
pub const TOTAL_SLOTS: u32 = 16384;

/// Highest valid slot
pub const MAX_SLOT: u32 = TOTAL_SLOTS - 1;

/// Inclusive slot range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u32,
    pub end: u32,
}

impl SlotRange {
    /// Create a range, rejecting reversed or out-of-space bounds
    pub fn new(start: u32, end: u32) -> Result<Self> {
        if start > MAX_SLOT {
            return Err(ControllerError::SlotOutOfRange(start));
        }
        if end > MAX_SLOT {
            return Err(ControllerError::SlotOutOfRange(end));
        }
        if start > end {
            return Err(ControllerError::validation(format!(
                "slot range start {} is greater than end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Range containing one slot
    pub fn single(slot: u32) -> Result<Self> {
        Self::new(slot, slot)
    }

    /// The whole slot space
    pub fn full() -> Self {
        Self { start: 0, end: MAX_SLOT }
    }

    /// Number of slots in the range (always >= 1)
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn contains(&self, slot: u32) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// True if `other` lies completely inside this range
    pub fn covers(&self, other: &SlotRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &SlotRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl std::str::FromStr for SlotRange {
    type Err = ControllerError;

    /// Parses `"100"` or `"100-200"`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let parse = |part: &str| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| ControllerError::validation(format!("invalid slot {:?}", part)))
        };
        match s.split_once('-') {
            Some((start, end)) => SlotRange::new(parse(start)?, parse(end)?),
            None => SlotRange::single(parse(s)?),
        }
    }
}

/// Insert `range` into a sorted, disjoint list, merging adjacent ranges
pub fn add_range(ranges: &mut Vec<SlotRange>, range: SlotRange) {
    ranges.push(range);
    ranges.sort();

    let mut merged: Vec<SlotRange> = Vec::with_capacity(ranges.len());
    for r in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if r.start <= last.end + 1 => {
                last.end = last.end.max(r.end);
            }
            _ => merged.push(r),
        }
    }
    *ranges = merged;
}

/// Remove `range` from a list, splitting ranges that straddle it
pub fn remove_range(ranges: &mut Vec<SlotRange>, range: SlotRange) {
    let mut result = Vec::with_capacity(ranges.len() + 1);
    for r in ranges.drain(..) {
        if !r.overlaps(&range) {
            result.push(r);
            continue;
        }
        if r.start < range.start {
            result.push(SlotRange { start: r.start, end: range.start - 1 });
        }
        if r.end > range.end {
            result.push(SlotRange { start: range.end + 1, end: r.end });
        }
    }
    *ranges = result;
}

/// True if the union of `ranges` covers every slot of `range`
pub fn ranges_cover(ranges: &[SlotRange], range: &SlotRange) -> bool {
    ranges.iter().any(|r| r.covers(range))
}

/// Split the slot space evenly across `shard_count` shards; the remainder
/// goes to the earliest shards
pub fn split_evenly(shard_count: usize) -> Vec<SlotRange> {
    if shard_count == 0 {
        return Vec::new();
    }
    let count = shard_count as u32;
    let base = TOTAL_SLOTS / count;
    let remainder = TOTAL_SLOTS % count;

    let mut start = 0;
    (0..count)
        .map(|i| {
            let len = base + u32::from(i < remainder);
            let range = SlotRange { start, end: start + len - 1 };
            start += len;
            range
        })
        .collect()
}
