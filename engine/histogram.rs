// ========================================================================================
//
//                         ONE-DIMENSIONAL WEIGHTED HISTOGRAMS
//
// ========================================================================================
//
// A `Histogram` is the unit accumulator of the engine. Values outside the configured
// range (and NaN) are dropped without touching any counter: there is no underflow or
// overflow bin, and `entries` only counts fills that landed in a bin. Because merging
// only adds counts, `merge` is commutative and associative.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BinningError {
    #[error("A histogram needs at least one bin.")]
    NoBins,
    #[error("Histogram range is invalid: low ({low}) must be finite and less than high ({high}).")]
    InvalidRange { low: f64, high: f64 },
    #[error("Explicit bin edges need at least two values, but {0} were given.")]
    TooFewEdges(usize),
    #[error("Bin edges must be finite and strictly increasing (violated at edge {index}).")]
    UnorderedEdges { index: usize },
}

/// How the axis of a histogram is divided into bins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binning {
    /// `bins` equal-width bins covering `[low, high)`.
    Uniform { bins: usize, low: f64, high: f64 },
    /// Variable-width bins; bin `i` covers `[edges[i], edges[i + 1])`.
    Edges(Vec<f64>),
}

impl Binning {
    pub fn uniform(bins: usize, low: f64, high: f64) -> Self {
        Binning::Uniform { bins, low, high }
    }

    pub fn validate(&self) -> Result<(), BinningError> {
        match self {
            Binning::Uniform { bins, low, high } => {
                if *bins == 0 {
                    return Err(BinningError::NoBins);
                }
                // The width must be finite too, or every value lands in bin 0.
                if !(low < high && (high - low).is_finite()) {
                    return Err(BinningError::InvalidRange {
                        low: *low,
                        high: *high,
                    });
                }
                Ok(())
            }
            Binning::Edges(edges) => {
                if edges.len() < 2 {
                    return Err(BinningError::TooFewEdges(edges.len()));
                }
                if let Some(index) = edges.iter().position(|e| !e.is_finite()) {
                    return Err(BinningError::UnorderedEdges { index });
                }
                if let Some(index) = edges.windows(2).position(|w| w[0] >= w[1]) {
                    return Err(BinningError::UnorderedEdges { index: index + 1 });
                }
                Ok(())
            }
        }
    }

    pub fn bin_count(&self) -> usize {
        match self {
            Binning::Uniform { bins, .. } => *bins,
            Binning::Edges(edges) => edges.len().saturating_sub(1),
        }
    }

    /// Locates the bin holding `value`, or `None` if it is out of range or NaN.
    #[inline]
    pub fn find_bin(&self, value: f64) -> Option<usize> {
        match self {
            Binning::Uniform { bins, low, high } => {
                if !(value >= *low && value < *high) {
                    return None;
                }
                let scaled = (value - low) / (high - low) * *bins as f64;
                // Rounding can push a value just below `high` onto the last edge.
                Some((scaled as usize).min(bins - 1))
            }
            Binning::Edges(edges) => {
                let first = *edges.first()?;
                let last = *edges.last()?;
                if !(value >= first && value < last) {
                    return None;
                }
                Some(edges.partition_point(|&edge| edge <= value) - 1)
            }
        }
    }

    /// Lower and upper edge of bin `index`.
    pub fn bin_edges(&self, index: usize) -> (f64, f64) {
        match self {
            Binning::Uniform { bins, low, high } => {
                let width = (high - low) / *bins as f64;
                let lo = low + width * index as f64;
                let hi = if index + 1 == *bins {
                    *high
                } else {
                    low + width * (index + 1) as f64
                };
                (lo, hi)
            }
            Binning::Edges(edges) => (edges[index], edges[index + 1]),
        }
    }
}

/// A named accumulator with fixed binning.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    name: String,
    title: String,
    binning: Binning,
    counts: Vec<f64>,
    entries: u64,
    sum_w: f64,
    sum_wx: f64,
    sum_wx2: f64,
}

impl Histogram {
    pub fn new(
        name: impl Into<String>,
        title: impl Into<String>,
        binning: Binning,
    ) -> Result<Self, BinningError> {
        binning.validate()?;
        let counts = vec![0.0; binning.bin_count()];
        Ok(Self {
            name: name.into(),
            title: title.into(),
            binning,
            counts,
            entries: 0,
            sum_w: 0.0,
            sum_wx: 0.0,
            sum_wx2: 0.0,
        })
    }

    /// Adds `weight` to the bin holding `value`. Returns whether the value was in range.
    #[inline]
    pub fn fill(&mut self, value: f64, weight: f64) -> bool {
        match self.binning.find_bin(value) {
            Some(bin) => {
                self.counts[bin] += weight;
                self.entries += 1;
                self.sum_w += weight;
                self.sum_wx += weight * value;
                self.sum_wx2 += weight * value * value;
                true
            }
            None => false,
        }
    }

    /// Adds the counts of `other` bin-for-bin. The caller guarantees identical binning.
    pub(crate) fn add_counts(&mut self, other: &Histogram) {
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            *mine += theirs;
        }
        self.entries += other.entries;
        self.sum_w += other.sum_w;
        self.sum_wx += other.sum_wx;
        self.sum_wx2 += other.sum_wx2;
    }

    pub fn same_binning(&self, other: &Histogram) -> bool {
        self.binning == other.binning
    }

    /// A histogram with the same name, title and binning but no content.
    pub fn empty_like(&self) -> Histogram {
        Histogram {
            name: self.name.clone(),
            title: self.title.clone(),
            binning: self.binning.clone(),
            counts: vec![0.0; self.counts.len()],
            entries: 0,
            sum_w: 0.0,
            sum_wx: 0.0,
            sum_wx2: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let mean = if self.sum_w != 0.0 {
            self.sum_wx / self.sum_w
        } else {
            0.0
        };
        let rms = if self.sum_w != 0.0 {
            (self.sum_wx2 / self.sum_w - mean * mean).max(0.0).sqrt()
        } else {
            0.0
        };
        HistogramSnapshot {
            name: self.name.clone(),
            title: self.title.clone(),
            binning: self.binning.clone(),
            counts: self.counts.clone(),
            entries: self.entries,
            sum_weights: self.sum_w,
            mean,
            rms,
        }
    }
}

/// An immutable copy of a histogram, handed to reporting and export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub name: String,
    pub title: String,
    pub binning: Binning,
    pub counts: Vec<f64>,
    pub entries: u64,
    pub sum_weights: f64,
    pub mean: f64,
    pub rms: f64,
}

impl HistogramSnapshot {
    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn uniform_binning_locates_values_and_drops_out_of_range() {
        let binning = Binning::uniform(10, 0.0, 10.0);
        assert_eq!(binning.find_bin(0.0), Some(0));
        assert_eq!(binning.find_bin(9.999), Some(9));
        assert_eq!(binning.find_bin(5.0), Some(5));
        assert_eq!(binning.find_bin(10.0), None);
        assert_eq!(binning.find_bin(-0.1), None);
        assert_eq!(binning.find_bin(f64::NAN), None);
    }

    #[test]
    fn edge_binning_uses_half_open_intervals() {
        let binning = Binning::Edges(vec![0.0, 1.0, 5.0, 20.0]);
        assert_eq!(binning.bin_count(), 3);
        assert_eq!(binning.find_bin(0.0), Some(0));
        assert_eq!(binning.find_bin(1.0), Some(1));
        assert_eq!(binning.find_bin(19.0), Some(2));
        assert_eq!(binning.find_bin(20.0), None);
        assert_eq!(binning.bin_edges(1), (1.0, 5.0));
    }

    #[test]
    fn invalid_binnings_are_rejected() {
        assert_eq!(
            Binning::uniform(0, 0.0, 1.0).validate(),
            Err(BinningError::NoBins)
        );
        for (low, high) in [(2.0, 1.0), (f64::NAN, 1.0), (0.0, f64::INFINITY), (-f64::MAX, f64::MAX)] {
            assert!(matches!(
                Binning::uniform(5, low, high).validate(),
                Err(BinningError::InvalidRange { .. })
            ));
        }
        assert_eq!(
            Binning::Edges(vec![1.0]).validate(),
            Err(BinningError::TooFewEdges(1))
        );
        assert_eq!(
            Binning::Edges(vec![0.0, 2.0, 2.0]).validate(),
            Err(BinningError::UnorderedEdges { index: 2 })
        );
    }

    #[test]
    fn total_count_equals_number_of_in_range_unit_fills() {
        let mut h = Histogram::new("h", "test", Binning::uniform(4, 0.0, 4.0)).unwrap();
        for value in [0.5, 1.5, 1.7, 3.9, 4.0, -1.0, f64::NAN] {
            h.fill(value, 1.0);
        }
        assert_eq!(h.entries(), 4);
        assert_eq!(h.counts(), &[1.0, 2.0, 0.0, 1.0]);
        assert_relative_eq!(h.snapshot().total(), 4.0);
    }

    #[test]
    fn snapshot_reports_weighted_mean_and_rms() {
        let mut h = Histogram::new("h", "test", Binning::uniform(10, 0.0, 10.0)).unwrap();
        h.fill(2.0, 1.0);
        h.fill(4.0, 3.0);
        let snap = h.snapshot();
        assert_relative_eq!(snap.mean, 3.5);
        assert_relative_eq!(snap.rms, (0.75f64).sqrt(), epsilon = 1e-12);
        assert_relative_eq!(snap.sum_weights, 4.0);
    }

    #[test]
    fn merging_is_order_independent() {
        let binning = Binning::uniform(5, 0.0, 5.0);
        let mut a = Histogram::new("h", "", binning.clone()).unwrap();
        let mut b = a.empty_like();
        let mut c = a.empty_like();
        a.fill(0.5, 1.0);
        b.fill(1.5, 1.0);
        b.fill(1.6, 1.0);
        c.fill(4.5, 1.0);

        let mut left = a.clone();
        left.add_counts(&b);
        left.add_counts(&c);

        let mut right = c.clone();
        right.add_counts(&a);
        right.add_counts(&b);

        assert_eq!(left.counts(), right.counts());
        assert_eq!(left.entries(), right.entries());
    }
}
