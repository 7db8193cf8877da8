use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// The batch size assumed when checking that a kernel's tensors are representable by the
/// execution runtime.
pub const MAX_BATCH_SIZE: u64 = 512;

/// The largest element count a single batched tensor may have.
pub const MAX_TENSOR_ELEMENTS: u64 = i32::MAX as u64;

/// Sane bounds for the FLOPs and parameter ratios of a reference network.
pub const MIN_CHECK_RATIO: f64 = 1e-4;
pub const MAX_CHECK_RATIO: f64 = 1e4;

/// An inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Range<T> {
    pub min: T,
    pub max: T,
}

impl<T: PartialOrd + Copy> Range<T> {
    pub fn new(min: T, max: T) -> Self {
        Range { min, max }
    }

    pub fn contains(&self, value: T) -> bool {
        self.min <= value && value <= self.max
    }

    pub fn is_point(&self) -> bool {
        self.min == self.max
    }
}

impl<T: Display> Display for Range<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}
