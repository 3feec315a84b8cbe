// ========================================================================================
//                          Pull-Model Worker Loop
// ========================================================================================

use crate::analysis::{ProcessError, RecordProcessor, panic_message};
use crate::bank::HistogramBank;
use crate::progress::ProgressObserver;
use crate::queue::{BoundedQueue, Popped};
use crate::report::RunningMean;
use crate::types::{Ordered, Outcome};
use std::panic::{AssertUnwindSafe, catch_unwind};
use thiserror::Error;

/// What one worker did over the whole run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStats {
    pub worker: usize,
    pub records: u64,
    pub accepted: u64,
    pub filtered: u64,
    pub accepted_value: RunningMean,
}

impl WorkerStats {
    pub fn new(worker: usize) -> Self {
        Self {
            worker,
            ..Self::default()
        }
    }
}

/// A record that could not be processed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("worker {worker} failed on record {ordinal}: {source}")]
pub struct WorkerFailure {
    pub worker: usize,
    pub ordinal: u64,
    #[source]
    pub source: ProcessError,
}

/// Pops records until end-of-stream and folds each into `bank`, which the calling
/// worker owns exclusively.
///
/// A panic inside the processor is caught and treated like a processing error, so it
/// is reported with the record's ordinal. On the first error the queue is closed, so
/// the producer stops, and the records still queued are discarded unprocessed before
/// the failure is returned. Every popped record is dropped before the next pop, on
/// every path.
pub fn run_worker<R, P>(
    worker: usize,
    queue: &BoundedQueue<Ordered<R>>,
    processor: &P,
    bank: &mut HistogramBank,
    progress: &dyn ProgressObserver,
) -> Result<WorkerStats, WorkerFailure>
where
    P: RecordProcessor<R>,
{
    let mut stats = WorkerStats::new(worker);
    while let Popped::Item(Ordered { ordinal, record }) = queue.pop() {
        let result = catch_unwind(AssertUnwindSafe(|| processor.process(&record, bank)))
            .unwrap_or_else(|payload| {
                Err(ProcessError::Failed(format!(
                    "panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });
        match result {
            Ok(Outcome::Accepted { value }) => {
                stats.accepted += 1;
                stats.accepted_value.push(value);
            }
            Ok(Outcome::Filtered) => stats.filtered += 1,
            Err(source) => {
                queue.close();
                let discarded = queue.drain().count();
                log::warn!(
                    "worker {worker}: record {ordinal} failed: {source}; {discarded} queued record(s) discarded"
                );
                return Err(WorkerFailure {
                    worker,
                    ordinal,
                    source,
                });
            }
        }
        stats.records += 1;
        progress.on_record();
    }
    log::debug!(
        "worker {worker} finished: {} record(s), {} accepted",
        stats.records,
        stats.accepted
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::HistogramSink;
    use crate::histogram::Binning;
    use crate::progress::NoopProgress;
    use crate::types::HistKey;

    /// Fills even values, filters odd ones and fails on 13.
    struct EvenOnly;

    impl RecordProcessor<u32> for EvenOnly {
        fn process<S: HistogramSink>(&self, record: &u32, sink: &mut S) -> Result<Outcome, ProcessError> {
            if *record == 13 {
                return Err(ProcessError::Failed("unlucky".to_string()));
            }
            if record % 2 == 1 {
                return Ok(Outcome::Filtered);
            }
            sink.fill(HistKey(0), f64::from(*record), 1.0)?;
            Ok(Outcome::Accepted {
                value: f64::from(*record),
            })
        }
    }

    fn bank() -> HistogramBank {
        let mut bank = HistogramBank::new(1);
        bank.create(HistKey(0), "values", "", Binning::uniform(20, 0.0, 20.0))
            .unwrap();
        bank
    }

    #[test]
    fn drains_the_queue_into_the_private_bank() {
        let queue = BoundedQueue::new(8).unwrap();
        for (ordinal, value) in [2u32, 3, 4, 5].into_iter().enumerate() {
            queue.push(Ordered::new(ordinal as u64, value)).unwrap();
        }
        queue.close();

        let mut bank = bank();
        let stats = run_worker(0, &queue, &EvenOnly, &mut bank, &NoopProgress).unwrap();
        assert_eq!((stats.records, stats.accepted, stats.filtered), (4, 2, 2));
        assert_eq!(stats.accepted_value.mean(), 3.0);
        assert_eq!(bank.snapshot(HistKey(0)).unwrap().entries, 2);
    }

    #[test]
    fn failure_reports_the_ordinal_and_closes_the_queue() {
        let queue = BoundedQueue::new(8).unwrap();
        for (ordinal, value) in [2u32, 13, 4].into_iter().enumerate() {
            queue.push(Ordered::new(ordinal as u64, value)).unwrap();
        }

        let mut bank = bank();
        let failure = run_worker(1, &queue, &EvenOnly, &mut bank, &NoopProgress).unwrap_err();
        assert_eq!(failure.ordinal, 1);
        assert_eq!(failure.worker, 1);
        assert!(queue.is_closed());
        assert!(queue.is_empty(), "records behind the failure are discarded");
        assert_eq!(bank.snapshot(HistKey(0)).unwrap().entries, 1);
        assert!(queue.push(Ordered::new(9, 6)).is_err());
    }

    /// Panics on 7.
    struct Cursed;

    impl RecordProcessor<u32> for Cursed {
        fn process<S: HistogramSink>(&self, record: &u32, sink: &mut S) -> Result<Outcome, ProcessError> {
            if *record == 7 {
                panic!("cursed record");
            }
            sink.fill(HistKey(0), f64::from(*record), 1.0)?;
            Ok(Outcome::Accepted {
                value: f64::from(*record),
            })
        }
    }

    #[test]
    fn panic_becomes_a_failure_with_the_ordinal() {
        let queue = BoundedQueue::new(8).unwrap();
        for (ordinal, value) in [1u32, 2, 7, 3].into_iter().enumerate() {
            queue.push(Ordered::new(ordinal as u64, value)).unwrap();
        }

        let mut bank = bank();
        let failure = run_worker(2, &queue, &Cursed, &mut bank, &NoopProgress).unwrap_err();
        assert_eq!(failure.ordinal, 2);
        assert_eq!(
            failure.source,
            ProcessError::Failed("panicked: cursed record".to_string())
        );
        assert!(queue.is_closed());
    }
}
