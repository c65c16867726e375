//! Core value types: index ranges, safe batch sizes and batch results

use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open range `[start, end)` of positions in a submitted sequence
///
/// Work items have positional identity; every split and merge in the
/// executor is expressed in terms of these ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchRange {
    /// First index, inclusive
    pub start: usize,
    /// Last index, exclusive
    pub end: usize,
}

impl BatchRange {
    /// Create a range. `end` is clamped up to `start` so the range is never inverted.
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end: if end < start { start } else { end },
        }
    }

    /// Number of items covered
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the range covers no items
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Split into two halves for bisection
    ///
    /// `mid = start + ceil(len / 2)`: the left half takes the larger share
    /// when the length is odd (`[0, 5)` splits into `[0, 3)` and `[3, 5)`).
    /// Returns `None` for ranges of length 0 or 1.
    #[must_use]
    pub const fn bisect(&self) -> Option<(Self, Self)> {
        let len = self.len();
        if len < 2 {
            return None;
        }
        let mid = self.start + (len + 1) / 2;
        Some((Self::new(self.start, mid), Self::new(mid, self.end)))
    }

    /// Partition `[0, total)` into contiguous ranges of at most `size` items
    ///
    /// Only the final range may be shorter. `size` of zero is treated as one.
    pub fn partition(total: usize, size: usize) -> impl Iterator<Item = Self> {
        let size = size.max(1);
        (0..total)
            .step_by(size)
            .map(move |start| Self::new(start, (start + size).min(total)))
    }

    /// `std` range for slicing
    #[must_use]
    pub const fn as_std(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

impl fmt::Display for BatchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Largest batch size the device can sustain for one model
///
/// Invariant: `safe_size >= 1`. The only way to change it is re-probing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeBatchSize {
    model_id: String,
    safe_size: u32,
}

impl SafeBatchSize {
    /// Create a safe size, clamping zero up to one
    pub fn new(model_id: impl Into<String>, safe_size: u32) -> Self {
        Self {
            model_id: model_id.into(),
            safe_size: safe_size.max(1),
        }
    }

    /// Model the size was probed for
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Probed batch size, always at least one
    #[must_use]
    pub const fn get(&self) -> u32 {
        self.safe_size
    }

    /// Probed batch size as an index width
    #[must_use]
    pub fn as_usize(&self) -> usize {
        usize::try_from(self.safe_size).unwrap_or(usize::MAX)
    }
}

/// Outputs of one successfully processed range
///
/// Invariant: `outputs.len() == range.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult<O> {
    range: BatchRange,
    outputs: Vec<O>,
}

impl<O> BatchResult<O> {
    /// Pair outputs with their range, returning the outputs back if the
    /// lengths disagree
    pub fn new(range: BatchRange, outputs: Vec<O>) -> Result<Self, Vec<O>> {
        if outputs.len() == range.len() {
            Ok(Self { range, outputs })
        } else {
            Err(outputs)
        }
    }

    /// Range these outputs belong to
    #[must_use]
    pub const fn range(&self) -> BatchRange {
        self.range
    }

    /// Outputs in index order
    #[must_use]
    pub fn outputs(&self) -> &[O] {
        &self.outputs
    }

    /// Consume into the output vector
    #[must_use]
    pub fn into_outputs(self) -> Vec<O> {
        self.outputs
    }
}
