//! Inclusive numeric ranges used by the stream and audio configuration

use serde::{Deserialize, Serialize};
use std::fmt;

/// An inclusive `min..=max` range of `u32` values.
///
/// A range of `0..=0` is "unset"; callers decide what that means (for the
/// jitter buffer it disables buffering, for sample-rate clamps it disables
/// clamping).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    /// Lower bound (inclusive)
    pub min: u32,
    /// Upper bound (inclusive)
    pub max: u32,
}

impl Range {
    /// Create a new range
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// True when `value` lies within `min..=max`
    pub fn contains(&self, value: u32) -> bool {
        value >= self.min && value <= self.max
    }

    /// True when both bounds are zero
    pub fn is_unset(&self) -> bool {
        self.min == 0 && self.max == 0
    }

    /// Clamp `value` the way sample-rate ranges are applied: a non-zero
    /// `min` raises the value, otherwise a non-zero `max` lowers it.
    pub fn clamp_preferred(&self, value: u32) -> u32 {
        if self.min != 0 {
            self.min.max(value)
        } else if self.max != 0 {
            self.max.min(value)
        } else {
            value
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}
