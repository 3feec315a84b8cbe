// ========================================================================================
//
//                     THE HISTOGRAM BANK: PER-KEY LOCKED AGGREGATES
//
// ========================================================================================
//
// ### Purpose ###
//
// A `HistogramBank` is the fixed collection of accumulators for a run. Its size is
// decided at construction and every slot is registered at most once, before any fill.
//
// Each slot carries its own mutex. In the push model the bank is shared behind an
// `Arc` and fills to different keys never contend; fills to the same key serialize.
// In the pull model every worker owns a private bank and fills through
// `fill_exclusive`, which reaches the histogram through `Mutex::get_mut` and therefore
// never locks at all.

use crate::histogram::{Binning, BinningError, Histogram, HistogramSnapshot};
use crate::types::HistKey;
use ahash::AHashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BankError {
    #[error("Histogram key {key} is outside the bank (size {size}).")]
    KeyOutOfRange { key: HistKey, size: usize },
    #[error("Histogram key {key} is already registered as '{name}'.")]
    AlreadyRegistered { key: HistKey, name: String },
    #[error("A histogram named '{0}' is already registered.")]
    DuplicateName(String),
    #[error("Histogram key {0} was used before it was created.")]
    Unregistered(HistKey),
    #[error("Cannot merge into histogram key {0}: the binnings differ.")]
    BinningMismatch(HistKey),
    #[error("Cannot merge banks with different layouts ({ours} vs {theirs} slots).")]
    LayoutMismatch { ours: usize, theirs: usize },
    #[error("Invalid binning for histogram '{name}': {source}")]
    Binning {
        name: String,
        #[source]
        source: BinningError,
    },
}

/// Anything that histograms can be filled into.
///
/// Processing code is written against this trait so that the same analysis runs
/// against a worker-private bank (`&mut HistogramBank`, lock-free) or the shared
/// bank of the push model (`&HistogramBank`, per-key locks).
pub trait HistogramSink {
    fn fill(&mut self, key: HistKey, value: f64, weight: f64) -> Result<(), BankError>;
}

impl HistogramSink for HistogramBank {
    #[inline]
    fn fill(&mut self, key: HistKey, value: f64, weight: f64) -> Result<(), BankError> {
        self.fill_exclusive(key, value, weight)
    }
}

impl HistogramSink for &HistogramBank {
    #[inline]
    fn fill(&mut self, key: HistKey, value: f64, weight: f64) -> Result<(), BankError> {
        HistogramBank::fill(self, key, value, weight)
    }
}

#[derive(Debug)]
pub struct HistogramBank {
    slots: Vec<Option<Mutex<Histogram>>>,
    names: AHashMap<String, HistKey>,
}

impl HistogramBank {
    /// Creates a bank with `size` empty slots.
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| None).collect(),
            names: AHashMap::with_capacity(size),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Registers a histogram under `key`. Must happen before any fill or merge on it.
    pub fn create(
        &mut self,
        key: impl Into<HistKey>,
        name: &str,
        title: &str,
        binning: Binning,
    ) -> Result<(), BankError> {
        let key = key.into();
        let size = self.slots.len();
        let slot = self
            .slots
            .get_mut(key.0)
            .ok_or(BankError::KeyOutOfRange { key, size })?;
        if let Some(existing) = slot {
            let existing = existing.get_mut().unwrap_or_else(PoisonError::into_inner);
            return Err(BankError::AlreadyRegistered {
                key,
                name: existing.name().to_string(),
            });
        }
        if self.names.contains_key(name) {
            return Err(BankError::DuplicateName(name.to_string()));
        }
        let histogram =
            Histogram::new(name, title, binning).map_err(|source| BankError::Binning {
                name: name.to_string(),
                source,
            })?;
        log::debug!("created histogram '{name}' at index {}", key.0);
        *slot = Some(Mutex::new(histogram));
        self.names.insert(name.to_string(), key);
        Ok(())
    }

    /// Fills `value` into the histogram at `key`, locking only that histogram.
    #[inline]
    pub fn fill(&self, key: impl Into<HistKey>, value: f64, weight: f64) -> Result<(), BankError> {
        let key = key.into();
        let mut histogram = self.lock(key)?;
        histogram.fill(value, weight);
        Ok(())
    }

    /// Same as [`HistogramBank::fill`] for a bank owned by a single worker; no locking.
    #[inline]
    pub fn fill_exclusive(
        &mut self,
        key: impl Into<HistKey>,
        value: f64,
        weight: f64,
    ) -> Result<(), BankError> {
        let key = key.into();
        self.slot_mut(key)?.fill(value, weight);
        Ok(())
    }

    /// Adds the counts of `other` into the histogram at `key`, bin-for-bin.
    pub fn merge(&self, key: impl Into<HistKey>, other: &Histogram) -> Result<(), BankError> {
        let key = key.into();
        let mut target = self.lock(key)?;
        if !target.same_binning(other) {
            return Err(BankError::BinningMismatch(key));
        }
        target.add_counts(other);
        Ok(())
    }

    /// Merges every registered histogram of `other` into `self`. Both banks must have
    /// the same layout (same size, same keys registered with the same binnings).
    pub fn merge_bank(&mut self, mut other: HistogramBank) -> Result<(), BankError> {
        if self.slots.len() != other.slots.len() {
            return Err(BankError::LayoutMismatch {
                ours: self.slots.len(),
                theirs: other.slots.len(),
            });
        }
        for (index, (mine, theirs)) in self.slots.iter_mut().zip(other.slots.iter_mut()).enumerate()
        {
            let key = HistKey(index);
            match (mine, theirs) {
                (Some(mine), Some(theirs)) => {
                    let mine = mine.get_mut().unwrap_or_else(PoisonError::into_inner);
                    let theirs = theirs.get_mut().unwrap_or_else(PoisonError::into_inner);
                    if !mine.same_binning(theirs) {
                        return Err(BankError::BinningMismatch(key));
                    }
                    mine.add_counts(theirs);
                }
                (None, None) => {}
                (Some(_), None) | (None, Some(_)) => return Err(BankError::Unregistered(key)),
            }
        }
        Ok(())
    }

    /// An immutable copy of the histogram at `key`.
    pub fn snapshot(&self, key: impl Into<HistKey>) -> Result<HistogramSnapshot, BankError> {
        Ok(self.lock(key.into())?.snapshot())
    }

    /// Snapshots of every registered histogram, in key order.
    pub fn snapshot_all(&self) -> Vec<HistogramSnapshot> {
        self.slots
            .iter()
            .flatten()
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).snapshot())
            .collect()
    }

    /// A bank with the same layout and zeroed content.
    pub fn empty_like(&self) -> HistogramBank {
        let slots = self
            .slots
            .iter()
            .map(|slot| {
                slot.as_ref().map(|h| {
                    Mutex::new(h.lock().unwrap_or_else(PoisonError::into_inner).empty_like())
                })
            })
            .collect();
        HistogramBank {
            slots,
            names: self.names.clone(),
        }
    }

    pub fn key_of(&self, name: &str) -> Option<HistKey> {
        self.names.get(name).copied()
    }

    fn lock(&self, key: HistKey) -> Result<MutexGuard<'_, Histogram>, BankError> {
        match self.slots.get(key.0) {
            Some(Some(slot)) => Ok(slot.lock().unwrap_or_else(PoisonError::into_inner)),
            Some(None) => Err(BankError::Unregistered(key)),
            None => Err(BankError::KeyOutOfRange {
                key,
                size: self.slots.len(),
            }),
        }
    }

    fn slot_mut(&mut self, key: HistKey) -> Result<&mut Histogram, BankError> {
        let size = self.slots.len();
        match self.slots.get_mut(key.0) {
            Some(Some(slot)) => Ok(slot.get_mut().unwrap_or_else(PoisonError::into_inner)),
            Some(None) => Err(BankError::Unregistered(key)),
            None => Err(BankError::KeyOutOfRange { key, size }),
        }
    }
}
