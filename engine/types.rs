// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use std::fmt;

/// A record together with the ordinal the source reader assigned to it.
///
/// Ordinals start at zero and count every record (not boundaries) in read order.
/// They are the identity used in diagnostics when a record fails to process.
#[derive(Debug, Clone, PartialEq)]
pub struct Ordered<R> {
    pub ordinal: u64,
    pub record: R,
}

impl<R> Ordered<R> {
    #[inline]
    pub fn new(ordinal: u64, record: R) -> Self {
        Self { ordinal, record }
    }
}

/// One item of an ordered input stream: either a data record or an administrative
/// boundary (for event files, a run header) that requires a full barrier.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem<R, B> {
    Record(R),
    Boundary(B),
}

/// Stable index of a histogram inside a [`crate::bank::HistogramBank`].
///
/// Analyses usually define an enum of their histograms and convert it into a key,
/// so the slot layout is fixed at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HistKey(pub usize);

impl From<usize> for HistKey {
    fn from(value: usize) -> Self {
        HistKey(value)
    }
}

impl fmt::Display for HistKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a processing task did with its record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// The record failed the selection; nothing was filled.
    Filtered,
    /// The record passed and was filled. `value` is the per-record scalar that the
    /// scheduler folds into its running mean.
    Accepted { value: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hist_key_displays_with_hash_prefix() {
        assert_eq!(HistKey(3).to_string(), "#3");
        assert_eq!(HistKey::from(7), HistKey(7));
    }
}
