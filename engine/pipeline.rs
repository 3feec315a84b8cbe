// ========================================================================================
//
//                     THE PULL MODEL: PRODUCER, BOUNDED QUEUE, N WORKERS
//
// ========================================================================================
//
// ### Purpose ###
//
// One scoped producer thread reads the source in order and pushes records into a
// `BoundedQueue`; a fixed pool of scoped worker threads drains the queue, each into
// a private `HistogramBank`. Workers never share an accumulator, so filling needs no
// locks at all. When every thread has joined, the private banks are folded into one
// with a rayon reduction; because histogram merging is commutative and associative,
// the result does not depend on which worker saw which record.
//
// ### Shutdown ###
//
// The producer owns a guard that closes the queue when it stops for any reason
// (end of data, record limit, source error, panic). A failing worker closes the
// queue itself, which makes the producer's next push fail and stop the read loop.
// Any failure discards every partial bank.

use crate::analysis::RecordProcessor;
use crate::bank::{BankError, HistogramBank};
use crate::config::RunConfig;
use crate::progress::{NoopProgress, ProgressObserver, RunStage};
use crate::queue::{BoundedQueue, QueueError};
use crate::report::{RunCounts, RunMode, RunReport, RunningMean};
use crate::source::{RecordSource, SourceError, SourceReader};
use crate::types::{Ordered, StreamItem};
use crate::worker::{WorkerFailure, WorkerStats, run_worker};
use rayon::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("The pull pipeline needs at least one worker.")]
    NoWorkers,
    #[error("Invalid queue: {0}")]
    Queue(#[from] QueueError),
    #[error("The record source failed after {records} record(s): {source}")]
    Source {
        records: u64,
        #[source]
        source: SourceError,
    },
    #[error("Processing aborted: {0}")]
    Worker(#[from] WorkerFailure),
    #[error("Merging the worker banks failed: {0}")]
    Merge(#[from] BankError),
    #[error("The {0} thread panicked.")]
    Panicked(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_records: Option<u64>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_capacity: 10,
            max_records: None,
        }
    }
}

impl From<&RunConfig> for PipelineSettings {
    fn from(config: &RunConfig) -> Self {
        Self {
            workers: config.workers,
            queue_capacity: config.queue_capacity,
            max_records: config.max_records,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub records_read: u64,
    pub boundaries_skipped: u64,
    pub accepted: u64,
    pub filtered: u64,
    pub accepted_value: RunningMean,
    /// One entry per worker, in worker order.
    pub workers: Vec<WorkerStats>,
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub bank: HistogramBank,
    pub stats: PipelineStats,
}

impl PipelineOutcome {
    pub fn report(&self, elapsed: Duration) -> RunReport {
        RunReport {
            mode: RunMode::Pull,
            concurrency: self.stats.workers.len(),
            counts: RunCounts {
                records_read: self.stats.records_read,
                accepted: self.stats.accepted,
                filtered: self.stats.filtered,
                boundaries: self.stats.boundaries_skipped,
                tasks: self.stats.workers.iter().map(|w| w.records).sum(),
            },
            accepted_value: self.stats.accepted_value,
            elapsed,
            histograms: self.bank.snapshot_all(),
        }
    }
}

pub struct PullPipeline {
    settings: PipelineSettings,
    progress: Arc<dyn ProgressObserver>,
}

#[derive(Debug, Default)]
struct ProducerStats {
    records: u64,
    boundaries: u64,
}

/// Closes the queue when dropped. The producer's guard always fires; a worker's
/// guard only fires while its thread unwinds, so the producer cannot block on a
/// queue nobody drains.
struct CloseGuard<'a, T> {
    queue: &'a BoundedQueue<T>,
    always: bool,
}

impl<T> Drop for CloseGuard<'_, T> {
    fn drop(&mut self) {
        if self.always || thread::panicking() {
            self.queue.close();
        }
    }
}

impl PullPipeline {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            progress: Arc::new(NoopProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Runs `source` to completion through `processor`.
    ///
    /// `template` fixes the bank layout; it is never filled itself. Every worker gets
    /// an empty copy.
    pub fn run<S, P>(
        &self,
        source: S,
        processor: &P,
        template: &HistogramBank,
    ) -> Result<PipelineOutcome, PipelineError>
    where
        S: RecordSource + Send,
        P: RecordProcessor<S::Record>,
    {
        let settings = &self.settings;
        if settings.workers == 0 {
            return Err(PipelineError::NoWorkers);
        }
        let queue = BoundedQueue::<Ordered<S::Record>>::new(settings.queue_capacity)?;
        let progress: &dyn ProgressObserver = self.progress.as_ref();
        progress.on_start(RunStage::Pull, settings.max_records);
        log::info!(
            "pull pipeline: {} worker(s), queue capacity {}",
            settings.workers,
            settings.queue_capacity
        );

        let (produced, joined) = thread::scope(|s| {
            let queue = &queue;
            let producer = s.spawn(move || {
                let feed = CloseGuard {
                    queue,
                    always: true,
                };
                produce(source, feed, settings.max_records, progress)
            });

            let workers: Vec<_> = (0..settings.workers)
                .map(|index| {
                    let mut bank = template.empty_like();
                    s.spawn(move || {
                        let guard = CloseGuard {
                            queue,
                            always: false,
                        };
                        run_worker(index, guard.queue, processor, &mut bank, progress)
                            .map(|stats| (stats, bank))
                    })
                })
                .collect();

            let joined: Vec<_> = workers
                .into_iter()
                .enumerate()
                .map(|(index, handle)| {
                    handle
                        .join()
                        .map_err(|_| PipelineError::Panicked(format!("worker {index}")))
                })
                .collect();
            let produced = producer
                .join()
                .map_err(|_| PipelineError::Panicked("producer".to_string()));
            (produced, joined)
        });

        // Panics first, then processing failures, then source failures: a worker
        // failure makes the producer stop, not the other way round.
        let mut finished = Vec::with_capacity(joined.len());
        for result in joined {
            finished.push(result?);
        }
        let produced = produced?;
        let mut banks = Vec::with_capacity(finished.len());
        let mut worker_stats = Vec::with_capacity(finished.len());
        for result in finished {
            let (stats, bank) = result?;
            worker_stats.push(stats);
            banks.push(bank);
        }
        let producer_stats = produced?;

        let bank = banks
            .into_par_iter()
            .map(Ok)
            .try_reduce(
                || template.empty_like(),
                |mut merged, bank| {
                    merged.merge_bank(bank)?;
                    Ok::<_, BankError>(merged)
                },
            )?;

        let mut stats = PipelineStats {
            records_read: producer_stats.records,
            boundaries_skipped: producer_stats.boundaries,
            ..PipelineStats::default()
        };
        for worker in &worker_stats {
            stats.accepted += worker.accepted;
            stats.filtered += worker.filtered;
            stats.accepted_value.merge(&worker.accepted_value);
        }
        stats.workers = worker_stats;

        progress.on_finish(RunStage::Pull);
        log::info!(
            "pull pipeline done: {} read, {} accepted, {} filtered, {} boundary record(s) skipped",
            stats.records_read,
            stats.accepted,
            stats.filtered,
            stats.boundaries_skipped
        );
        Ok(PipelineOutcome { bank, stats })
    }
}

/// The producer loop. Boundaries carry no histogram data in the pull model; they
/// are counted and skipped.
fn produce<S: RecordSource>(
    source: S,
    feed: CloseGuard<'_, Ordered<S::Record>>,
    max_records: Option<u64>,
    progress: &dyn ProgressObserver,
) -> Result<ProducerStats, PipelineError> {
    let mut reader = SourceReader::new(source);
    let mut stats = ProducerStats::default();

    let result = loop {
        if max_records.is_some_and(|max| stats.records >= max) {
            log::info!("record limit reached after {} record(s)", stats.records);
            break Ok(());
        }
        match reader.next_item() {
            Ok(None) => break Ok(()),
            Ok(Some(StreamItem::Boundary(_))) => {
                let seen = reader.boundaries_read();
                log::debug!("skipping boundary record {seen}");
                progress.on_boundary(seen);
            }
            Ok(Some(StreamItem::Record(ordered))) => {
                if feed.queue.push(ordered).is_err() {
                    log::debug!("queue closed by a worker; producer stopping");
                    break Ok(());
                }
                stats.records += 1;
            }
            Err(source) => break Err(source),
        }
    };

    drop(feed);
    stats.boundaries = reader.boundaries_read();
    let closed = reader.close();
    let records = stats.records;
    result
        .and(closed)
        .map_err(|source| PipelineError::Source { records, source })?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ProcessError;
    use crate::bank::HistogramSink;
    use crate::histogram::Binning;
    use crate::source::VecSource;
    use crate::types::{HistKey, Outcome};
    use std::sync::Mutex;

    struct Identity;

    #[derive(Default)]
    struct BoundaryLog(Mutex<Vec<u64>>);

    impl ProgressObserver for BoundaryLog {
        fn on_boundary(&self, boundaries: u64) {
            self.0.lock().unwrap().push(boundaries);
        }
    }

    impl RecordProcessor<f64> for Identity {
        fn process<S: HistogramSink>(&self, record: &f64, sink: &mut S) -> Result<Outcome, ProcessError> {
            if *record < 0.0 {
                return Ok(Outcome::Filtered);
            }
            if record.is_nan() {
                return Err(ProcessError::InvalidInput("NaN record".to_string()));
            }
            sink.fill(HistKey(0), *record, 1.0)?;
            Ok(Outcome::Accepted { value: *record })
        }
    }

    fn template() -> HistogramBank {
        let mut bank = HistogramBank::new(1);
        bank.create(HistKey(0), "x", "", Binning::uniform(10, 0.0, 10.0))
            .unwrap();
        bank
    }

    fn settings(workers: usize, max_records: Option<u64>) -> PipelineSettings {
        PipelineSettings {
            workers,
            queue_capacity: 2,
            max_records,
        }
    }

    #[test]
    fn every_record_is_counted_exactly_once() {
        let records: Vec<f64> = (0..500).map(|i| f64::from(i % 12) - 1.0).collect();
        let pipeline = PullPipeline::new(settings(4, None));
        let outcome = pipeline
            .run(VecSource::<f64, ()>::from_records(records), &Identity, &template())
            .unwrap();

        let stats = &outcome.stats;
        assert_eq!(stats.records_read, 500);
        assert_eq!(stats.accepted + stats.filtered, 500);
        assert_eq!(stats.workers.iter().map(|w| w.records).sum::<u64>(), 500);
        // 42 records of -1 are filtered; the 41 tens are accepted but fall outside the range.
        assert_eq!(stats.filtered, 42);
        let snap = outcome.bank.snapshot(HistKey(0)).unwrap();
        assert_eq!(snap.total(), 500.0 - 42.0 - 41.0);
    }

    #[test]
    fn boundaries_are_skipped_and_counted() {
        let source = VecSource::new([
            StreamItem::Boundary("run 1"),
            StreamItem::Record(1.5),
            StreamItem::Boundary("run 2"),
            StreamItem::Record(2.5),
        ]);
        let log = Arc::new(BoundaryLog::default());
        let outcome = PullPipeline::new(settings(2, None))
            .with_progress(log.clone())
            .run(source, &Identity, &template())
            .unwrap();
        assert_eq!(outcome.stats.records_read, 2);
        assert_eq!(outcome.stats.boundaries_skipped, 2);
        assert_eq!(*log.0.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn record_limit_stops_the_producer() {
        let source = VecSource::<f64, ()>::from_records((0..100).map(|i| f64::from(i % 10)));
        let outcome = PullPipeline::new(settings(3, Some(25)))
            .run(source, &Identity, &template())
            .unwrap();
        assert_eq!(outcome.stats.records_read, 25);
        assert_eq!(outcome.bank.snapshot(HistKey(0)).unwrap().entries, 25);
    }

    #[test]
    fn processing_failure_aborts_with_the_ordinal() {
        let mut records: Vec<f64> = vec![1.0; 200];
        records[57] = f64::NAN;
        let result = PullPipeline::new(settings(3, None)).run(
            VecSource::<f64, ()>::from_records(records),
            &Identity,
            &template(),
        );
        match result {
            Err(PipelineError::Worker(failure)) => assert_eq!(failure.ordinal, 57),
            other => panic!("expected a worker failure, got {other:?}"),
        }
    }

    #[test]
    fn empty_source_yields_an_empty_bank() {
        let outcome = PullPipeline::new(settings(2, None))
            .run(VecSource::<f64, ()>::new([]), &Identity, &template())
            .unwrap();
        assert_eq!(outcome.stats.records_read, 0);
        assert_eq!(outcome.bank.snapshot(HistKey(0)).unwrap().entries, 0);
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(matches!(
            PullPipeline::new(settings(0, None)).run(
                VecSource::<f64, ()>::new([]),
                &Identity,
                &template()
            ),
            Err(PipelineError::NoWorkers)
        ));
    }
}
