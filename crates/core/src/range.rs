//! Part ranges: spans of part numbers materialized as one physical object.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An inclusive `[lower, upper]` span of part numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartRange {
    lower: u32,
    upper: u32,
}

impl PartRange {
    /// Create a range, rejecting empty or zero-based spans.
    pub fn new(lower: u32, upper: u32) -> Result<Self> {
        if lower == 0 {
            return Err(Error::InvalidPartRange(format!(
                "lower bound must be at least 1, got {lower}"
            )));
        }
        if upper < lower {
            return Err(Error::InvalidPartRange(format!(
                "upper bound {upper} is below lower bound {lower}"
            )));
        }
        Ok(Self { lower, upper })
    }

    /// The range holding exactly one part.
    pub fn single(part_number: u32) -> Result<Self> {
        Self::new(part_number, part_number)
    }

    pub fn lower(&self) -> u32 {
        self.lower
    }

    pub fn upper(&self) -> u32 {
        self.upper
    }

    pub fn is_single(&self) -> bool {
        self.lower == self.upper
    }

    /// Number of parts covered.
    pub fn len(&self) -> u32 {
        self.upper - self.lower + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// True when `self` lies entirely inside `[lower, upper]`.
    pub fn within(&self, lower: u32, upper: u32) -> bool {
        self.lower >= lower && self.upper <= upper
    }

    pub fn overlaps(&self, other: &PartRange) -> bool {
        self.lower <= other.upper && other.lower <= self.upper
    }

    /// True when `right` starts immediately after `self` ends.
    pub fn precedes(&self, right: &PartRange) -> bool {
        self.upper.checked_add(1) == Some(right.lower)
    }
}

impl fmt::Display for PartRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.lower, self.upper)
    }
}

/// Two adjacent ranges that can be composed into one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContiguousPair {
    pub left: PartRange,
    pub right: PartRange,
}

impl ContiguousPair {
    /// Pair `left` with `right`; fails unless `left.upper + 1 == right.lower`.
    pub fn new(left: PartRange, right: PartRange) -> Result<Self> {
        if !left.precedes(&right) {
            return Err(Error::InvalidPartRange(format!(
                "ranges {left} and {right} are not contiguous"
            )));
        }
        Ok(Self { left, right })
    }

    /// The span covered once the pair is composed.
    pub fn merged(&self) -> PartRange {
        PartRange {
            lower: self.left.lower,
            upper: self.right.upper,
        }
    }
}

impl fmt::Display for ContiguousPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]+[{}]", self.left, self.right)
    }
}

/// Ordering for contiguous-pair lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeOrder {
    /// Shuffled; spreads opportunistic merges across concurrent uploaders.
    Random,
    /// Lowest bound first; deterministic draining at completion.
    Ascending,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_range_rejects_bad_bounds() {
        assert!(PartRange::new(0, 3).is_err());
        assert!(PartRange::new(5, 4).is_err());
        assert!(PartRange::new(4, 4).unwrap().is_single());
    }

    #[test]
    fn test_part_range_geometry() {
        let range = PartRange::new(5, 24).unwrap();
        assert_eq!(range.len(), 20);
        assert!(range.within(1, 24));
        assert!(!range.within(6, 30));
        assert!(range.overlaps(&PartRange::new(3, 10).unwrap()));
        assert!(!range.overlaps(&PartRange::new(25, 30).unwrap()));
        assert_eq!(range.to_string(), "5-24");
    }

    #[test]
    fn test_contiguous_pair_merges() {
        let left = PartRange::new(8, 9).unwrap();
        let right = PartRange::new(10, 20).unwrap();
        let pair = ContiguousPair::new(left, right).unwrap();
        assert_eq!(pair.merged(), PartRange::new(8, 20).unwrap());

        let gap = PartRange::new(11, 20).unwrap();
        assert!(ContiguousPair::new(left, gap).is_err());
        assert!(ContiguousPair::new(right, left).is_err());
    }
}
