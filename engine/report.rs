// ========================================================================================
//
//                          RUN SUMMARY AND HISTOGRAM EXPORT
//
// ========================================================================================
//
// ### Purpose ###
//
// Both execution models end in a `RunReport`: counts, the mean of the accepted
// per-record values and immutable snapshots of every histogram. The report is
// written as a small TOML summary next to one CSV per histogram
// (`bin_low,bin_high,count`), which is all a plotting script needs.

use crate::histogram::HistogramSnapshot;
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const SUMMARY_FILE: &str = "summary.toml";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to write histogram CSV: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Failed to serialize run summary to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Histogram name '{0}' cannot be used as a file name.")]
    UnsafeName(String),
}

/// Incremental arithmetic mean.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    count: u64,
    mean: f64,
}

impl RunningMean {
    #[inline]
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
    }

    /// Combines two means as if every value had been pushed into one.
    pub fn merge(&mut self, other: &RunningMean) {
        if other.count == 0 {
            return;
        }
        let total = self.count + other.count;
        self.mean += (other.mean - self.mean) * (other.count as f64 / total as f64);
        self.count = total;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// The mean so far, or 0 when nothing was pushed.
    pub fn mean(&self) -> f64 {
        self.mean
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Pull,
    Push,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub records_read: u64,
    pub accepted: u64,
    pub filtered: u64,
    pub boundaries: u64,
    /// Push model: tasks completed. Pull model: records processed by workers.
    pub tasks: u64,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: RunMode,
    pub concurrency: usize,
    pub counts: RunCounts,
    pub accepted_value: RunningMean,
    pub elapsed: Duration,
    pub histograms: Vec<HistogramSnapshot>,
}

#[derive(Serialize)]
struct Summary<'a> {
    mode: RunMode,
    concurrency: usize,
    elapsed_seconds: f64,
    mean_accepted_value: f64,
    counts: &'a RunCounts,
    histograms: Vec<HistogramSummary<'a>>,
}

#[derive(Serialize)]
struct HistogramSummary<'a> {
    name: &'a str,
    title: &'a str,
    bins: usize,
    entries: u64,
    sum_weights: f64,
    mean: f64,
    rms: f64,
}

#[derive(Serialize)]
struct BinRow {
    bin_low: f64,
    bin_high: f64,
    count: f64,
}

impl RunReport {
    /// The one-line closing message of a run.
    pub fn headline(&self) -> String {
        format!(
            "Finished processing of {} events with average energy = {:.4} GeV",
            self.counts.accepted,
            self.accepted_value.mean()
        )
    }

    pub fn summary_toml(&self) -> Result<String, ReportError> {
        let summary = Summary {
            mode: self.mode,
            concurrency: self.concurrency,
            elapsed_seconds: self.elapsed.as_secs_f64(),
            mean_accepted_value: self.accepted_value.mean(),
            counts: &self.counts,
            histograms: self
                .histograms
                .iter()
                .map(|h| HistogramSummary {
                    name: &h.name,
                    title: &h.title,
                    bins: h.counts.len(),
                    entries: h.entries,
                    sum_weights: h.sum_weights,
                    mean: h.mean,
                    rms: h.rms,
                })
                .collect(),
        };
        Ok(toml::to_string_pretty(&summary)?)
    }

    /// Writes `summary.toml` and `<name>.csv` per histogram into `dir`, creating it
    /// if needed. Returns the paths written. Nothing is written if any histogram name
    /// is not a plain file stem.
    pub fn write_to_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, ReportError> {
        if let Some(bad) = self.histograms.iter().find(|h| !is_safe_file_stem(&h.name)) {
            return Err(ReportError::UnsafeName(bad.name.clone()));
        }
        fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(self.histograms.len() + 1);

        let summary_path = dir.join(SUMMARY_FILE);
        let mut file = BufWriter::new(fs::File::create(&summary_path)?);
        file.write_all(self.summary_toml()?.as_bytes())?;
        file.flush()?;
        written.push(summary_path);

        for histogram in &self.histograms {
            let path = dir.join(format!("{}.csv", histogram.name));
            write_histogram_csv(histogram, fs::File::create(&path)?)?;
            written.push(path);
        }
        log::info!("wrote {} report file(s) to {}", written.len(), dir.display());
        Ok(written)
    }
}

fn is_safe_file_stem(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Writes one histogram as `bin_low,bin_high,count` rows.
pub fn write_histogram_csv<W: Write>(
    histogram: &HistogramSnapshot,
    out: W,
) -> Result<(), ReportError> {
    let mut writer = csv::Writer::from_writer(out);
    for (index, &count) in histogram.counts.iter().enumerate() {
        let (bin_low, bin_high) = histogram.binning.bin_edges(index);
        writer.serialize(BinRow {
            bin_low,
            bin_high,
            count,
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::{Binning, Histogram};
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    fn report() -> RunReport {
        let mut h = Histogram::new("muon_mass", "mu mu", Binning::uniform(2, 0.0, 2.0)).unwrap();
        h.fill(0.5, 1.0);
        h.fill(1.5, 1.0);
        h.fill(1.5, 1.0);
        let mut mean = RunningMean::default();
        mean.push(200.0);
        mean.push(220.0);
        RunReport {
            mode: RunMode::Pull,
            concurrency: 3,
            counts: RunCounts {
                records_read: 3,
                accepted: 2,
                filtered: 1,
                boundaries: 1,
                tasks: 3,
            },
            accepted_value: mean,
            elapsed: Duration::from_millis(1500),
            histograms: vec![h.snapshot()],
        }
    }

    #[test]
    fn running_mean_merges_like_a_single_stream() {
        let values = [1.0, 4.0, 9.0, 16.0, 25.0];
        let mut whole = RunningMean::default();
        values.iter().for_each(|&v| whole.push(v));

        let mut left = RunningMean::default();
        let mut right = RunningMean::default();
        values[..2].iter().for_each(|&v| left.push(v));
        values[2..].iter().for_each(|&v| right.push(v));
        left.merge(&right);

        assert_eq!(left.count(), 5);
        assert_relative_eq!(left.mean(), whole.mean(), epsilon = 1e-12);
        assert_relative_eq!(whole.mean(), 11.0, epsilon = 1e-12);
    }

    #[test]
    fn csv_lists_every_bin_with_its_edges() {
        let mut out = Vec::new();
        write_histogram_csv(&report().histograms[0], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "bin_low,bin_high,count\n0.0,1.0,1.0\n1.0,2.0,2.0\n");
    }

    #[test]
    fn headline_uses_accepted_count_and_mean() {
        assert_eq!(
            report().headline(),
            "Finished processing of 2 events with average energy = 210.0000 GeV"
        );
    }

    #[test]
    fn report_directory_holds_summary_and_csvs() {
        let dir = tempdir().unwrap();
        let written = report().write_to_dir(&dir.path().join("out")).unwrap();
        assert_eq!(written.len(), 2);
        let summary = fs::read_to_string(&written[0]).unwrap();
        let parsed: toml::Value = toml::from_str(&summary).unwrap();
        assert_eq!(parsed["mode"].as_str(), Some("pull"));
        assert_eq!(parsed["counts"]["accepted"].as_integer(), Some(2));
        assert_eq!(parsed["histograms"][0]["entries"].as_integer(), Some(3));
        assert!(written[1].ends_with("muon_mass.csv"));
    }

    #[test]
    fn histogram_names_must_be_plain_file_stems() {
        let mut bad = report();
        let mut escaping = bad.histograms[0].clone();
        escaping.name = "../escape".to_string();
        bad.histograms.push(escaping);
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        assert!(matches!(
            bad.write_to_dir(&out),
            Err(ReportError::UnsafeName(_))
        ));
        assert!(!out.exists(), "an unsafe name must leave no output behind");
    }
}
