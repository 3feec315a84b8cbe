// ========================================================================================
//
//                                RUN CONFIGURATION
//
// ========================================================================================
//
// ### Purpose ###
//
// Everything a run needs to know before the first record is read: concurrency
// limits, the selection, and the histograms to book. A configuration is plain data,
// stored as TOML, validated once on load and turned into a `HistogramBank` whose
// slot order follows the order of the `histograms` list.

use crate::analysis::{RecoilHistogram, Selection};
use crate::bank::{BankError, HistogramBank};
use crate::histogram::{Binning, BinningError};
use crate::types::HistKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Environment variable that overrides the push-model admission limit.
pub const MAX_THREADS_ENV: &str = "RECOIL_MAX_THREADS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("'{0}' must be at least 1.")]
    ZeroLimit(&'static str),
    #[error("The selection needs at least two {0}, as the analysis pairs the first two.")]
    Multiplicity(&'static str),
    #[error("sqrt_s must be a positive, finite energy; got {0}.")]
    InvalidEnergy(f64),
    #[error("Histogram '{0}' is defined more than once.")]
    DuplicateHistogram(String),
    #[error("Histogram '{name}' has an invalid binning: {source}")]
    Binning {
        name: String,
        #[source]
        source: BinningError,
    },
}

/// One histogram to book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSpec {
    pub name: String,
    #[serde(default)]
    pub title: String,
    pub binning: Binning,
}

impl HistogramSpec {
    pub fn new(name: &str, title: &str, binning: Binning) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            binning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Push-model in-flight task limit. Defaults to the hardware parallelism.
    pub max_threads: Option<usize>,
    /// Pull-model queue capacity.
    pub queue_capacity: usize,
    /// Pull-model worker count.
    pub workers: usize,
    /// Stop after this many records.
    pub max_records: Option<u64>,
    pub selection: Selection,
    pub histograms: Vec<HistogramSpec>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_threads: None,
            queue_capacity: 10,
            workers: 3,
            max_records: None,
            selection: Selection::default(),
            histograms: RecoilHistogram::ALL
                .into_iter()
                .map(default_histogram)
                .collect(),
        }
    }
}

fn default_histogram(which: RecoilHistogram) -> HistogramSpec {
    match which {
        RecoilHistogram::MuonMass => HistogramSpec::new(
            which.name(),
            "Invariant mass of the muon pair",
            Binning::uniform(100, 60.0, 120.0),
        ),
        RecoilHistogram::JetMass => HistogramSpec::new(
            which.name(),
            "Invariant mass of the jet pair",
            Binning::uniform(100, 0.0, 150.0),
        ),
        RecoilHistogram::RecoilMass => HistogramSpec::new(
            which.name(),
            "Mass recoiling against the muon pair",
            Binning::uniform(100, 110.0, 170.0),
        ),
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: RunConfig = toml::from_str(&toml_string)?;
        config.validate()?;
        log::debug!("loaded run config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroLimit("queue_capacity"));
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroLimit("workers"));
        }
        if self.max_threads == Some(0) {
            return Err(ConfigError::ZeroLimit("max_threads"));
        }
        if self.selection.muons < 2 {
            return Err(ConfigError::Multiplicity("muons"));
        }
        if self.selection.jets < 2 {
            return Err(ConfigError::Multiplicity("jets"));
        }
        if !(self.selection.sqrt_s.is_finite() && self.selection.sqrt_s > 0.0) {
            return Err(ConfigError::InvalidEnergy(self.selection.sqrt_s));
        }

        let mut seen = HashSet::new();
        for spec in &self.histograms {
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateHistogram(spec.name.clone()));
            }
            spec.binning.validate().map_err(|source| ConfigError::Binning {
                name: spec.name.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Books every configured histogram, in list order, into a fresh bank.
    pub fn build_bank(&self) -> Result<HistogramBank, BankError> {
        let mut bank = HistogramBank::new(self.histograms.len());
        for (index, spec) in self.histograms.iter().enumerate() {
            bank.create(HistKey(index), &spec.name, &spec.title, spec.binning.clone())?;
        }
        Ok(bank)
    }

    /// The push-model admission limit.
    ///
    /// `env_value` is the raw value of [`MAX_THREADS_ENV`], if set. When present it
    /// wins over the config; anything that is not a positive integer resolves to 1.
    /// Without it the configured `max_threads` is used, else the hardware parallelism.
    pub fn resolve_max_threads(&self, env_value: Option<String>) -> usize {
        if let Some(raw) = env_value {
            return match raw.trim().parse::<i64>() {
                Ok(n) if n >= 1 => usize::try_from(n).unwrap_or(usize::MAX),
                _ => {
                    log::warn!("{MAX_THREADS_ENV}='{raw}' is not a positive integer; using 1");
                    1
                }
            };
        }
        self.max_threads.unwrap_or_else(num_cpus::get).max(1)
    }

    /// [`RunConfig::resolve_max_threads`] against the process environment.
    pub fn max_threads_from_env(&self) -> usize {
        self.resolve_max_threads(std::env::var(MAX_THREADS_ENV).ok())
    }
}
