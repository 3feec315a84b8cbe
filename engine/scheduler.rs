// ========================================================================================
//
//                THE PUSH MODEL: AN ADMISSION-CONTROLLED TASK SCHEDULER
//
// ========================================================================================
//
// ### Purpose ###
//
// The reader thread pushes every record into the `Scheduler`, which turns it into a
// task on a dedicated rayon pool. At most `max_tasks` tasks are in flight: when the
// limit is reached, `start_task` blocks on the completion channel until some task
// reports back. All tasks fill one shared `HistogramBank`, locking per histogram.
//
// Boundary records (run headers) are a full barrier: `on_boundary` waits for every
// in-flight task before handing the boundary and the bank to a `BoundaryHandler`, so
// the handler sees every fill of every record read before the boundary.
//
// ### Failure ###
//
// A task that errors or panics is caught on the pool thread and reported with its
// record ordinal. The first failure is latched: no further tasks are started,
// in-flight tasks are drained, and the run ends with that failure. Partial
// aggregates are not reported.

use crate::analysis::{ProcessError, RecordProcessor, panic_message};
use crate::bank::HistogramBank;
use crate::progress::{NoopProgress, ProgressObserver, RunStage};
use crate::report::{RunCounts, RunMode, RunReport, RunningMean};
use crate::source::{RecordSource, SourceError, SourceReader};
use crate::types::{Ordered, Outcome, StreamItem};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a single task did not produce an outcome.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("task panicked: {0}")]
    Panicked(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("record {ordinal} failed: {error}")]
pub struct TaskFailure {
    pub ordinal: u64,
    pub error: TaskError,
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("The scheduler needs room for at least one task.")]
    NoTasks,
    #[error("Failed to build the task pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("Processing aborted: {0}")]
    Task(TaskFailure),
    #[error("The record source failed: {0}")]
    Source(#[from] SourceError),
    #[error("The task completion channel closed with {0} task(s) still in flight.")]
    ChannelClosed(usize),
}

/// Receives each boundary record once every task started before it has finished.
pub trait BoundaryHandler<B> {
    fn handle(&mut self, boundary: &B, bank: &HistogramBank);
}

impl<B, F> BoundaryHandler<B> for F
where
    F: FnMut(&B, &HistogramBank),
{
    fn handle(&mut self, boundary: &B, bank: &HistogramBank) {
        self(boundary, bank)
    }
}

/// Something a record stream can be dispatched into, one item at a time.
pub trait StreamListener<R, B> {
    type Error: From<SourceError>;

    fn on_record(&mut self, record: Ordered<R>) -> Result<(), Self::Error>;
    fn on_boundary(&mut self, boundary: B) -> Result<(), Self::Error>;
}

/// Reads `source` to the end (or `max_records`) and dispatches every item into
/// `listener`. The source is closed on every path. Returns the number of records read.
pub fn drive<S, L>(source: S, listener: &mut L, max_records: Option<u64>) -> Result<u64, L::Error>
where
    S: RecordSource,
    L: StreamListener<S::Record, S::Boundary>,
{
    let mut reader = SourceReader::new(source);
    let result = dispatch(&mut reader, listener, max_records);
    let closed = reader.close();
    let records = result?;
    closed?;
    Ok(records)
}

fn dispatch<S, L>(
    reader: &mut SourceReader<S>,
    listener: &mut L,
    max_records: Option<u64>,
) -> Result<u64, L::Error>
where
    S: RecordSource,
    L: StreamListener<S::Record, S::Boundary>,
{
    while max_records.is_none_or(|max| reader.records_read() < max) {
        match reader.next_item()? {
            None => break,
            Some(StreamItem::Record(record)) => listener.on_record(record)?,
            Some(StreamItem::Boundary(boundary)) => listener.on_boundary(boundary)?,
        }
    }
    Ok(reader.records_read())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    pub accepted: u64,
    pub filtered: u64,
    pub failed: u64,
    pub boundaries: u64,
    pub peak_in_flight: usize,
    pub accepted_value: RunningMean,
}

impl SchedulerStats {
    pub fn report(&self, max_tasks: usize, bank: &HistogramBank, elapsed: Duration) -> RunReport {
        RunReport {
            mode: RunMode::Push,
            concurrency: max_tasks,
            counts: RunCounts {
                records_read: self.submitted,
                accepted: self.accepted,
                filtered: self.filtered,
                boundaries: self.boundaries,
                tasks: self.completed,
            },
            accepted_value: self.accepted_value,
            elapsed,
            histograms: bank.snapshot_all(),
        }
    }
}

struct Completion {
    ordinal: u64,
    result: Result<Outcome, TaskError>,
}

pub struct Scheduler<R, B, P> {
    max_tasks: usize,
    pool: rayon::ThreadPool,
    bank: Arc<HistogramBank>,
    processor: Arc<P>,
    progress: Arc<dyn ProgressObserver>,
    boundary_handler: Option<Box<dyn BoundaryHandler<B>>>,
    done_tx: Sender<Completion>,
    done_rx: Receiver<Completion>,
    in_flight: usize,
    stats: SchedulerStats,
    failure: Option<TaskFailure>,
    records: PhantomData<fn(R)>,
}

impl<R, B, P> Scheduler<R, B, P>
where
    R: Send + 'static,
    B: 'static,
    P: RecordProcessor<R> + 'static,
{
    pub fn new(
        max_tasks: usize,
        bank: Arc<HistogramBank>,
        processor: Arc<P>,
    ) -> Result<Self, SchedulerError> {
        if max_tasks == 0 {
            return Err(SchedulerError::NoTasks);
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_tasks)
            .thread_name(|index| format!("recoil-task-{index}"))
            .build()?;
        let (done_tx, done_rx) = unbounded();
        log::info!("scheduler created with max_tasks = {max_tasks}");
        Ok(Self {
            max_tasks,
            pool,
            bank,
            processor,
            progress: Arc::new(NoopProgress),
            boundary_handler: None,
            done_tx,
            done_rx,
            in_flight: 0,
            stats: SchedulerStats::default(),
            failure: None,
            records: PhantomData,
        })
    }

    pub fn with_boundary_handler(mut self, handler: impl BoundaryHandler<B> + 'static) -> Self {
        self.boundary_handler = Some(Box::new(handler));
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        progress.on_start(RunStage::Push, None);
        self.progress = progress;
        self
    }

    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn bank(&self) -> &Arc<HistogramBank> {
        &self.bank
    }

    /// Submits one record, first waiting for a free slot if `max_tasks` tasks are
    /// still in flight after collecting the ones already finished. Fails without
    /// submitting once a task has failed.
    pub fn start_task(&mut self, record: Ordered<R>) -> Result<(), SchedulerError> {
        self.process_finished_tasks();
        while self.failure.is_none() && self.in_flight >= self.max_tasks {
            self.collect_one()?;
        }
        if let Some(failure) = &self.failure {
            return Err(SchedulerError::Task(failure.clone()));
        }

        let bank = Arc::clone(&self.bank);
        let processor = Arc::clone(&self.processor);
        let done_tx = self.done_tx.clone();
        self.in_flight += 1;
        self.stats.submitted += 1;
        self.stats.peak_in_flight = self.stats.peak_in_flight.max(self.in_flight);

        self.pool.spawn(move || {
            let Ordered { ordinal, record } = record;
            let result = catch_unwind(AssertUnwindSafe(|| {
                let mut sink: &HistogramBank = &bank;
                processor.process(&record, &mut sink)
            }));
            let result = match result {
                Ok(outcome) => outcome.map_err(TaskError::from),
                Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
            };
            drop(record);
            // The scheduler owns a sender too, so the channel outlives every task.
            done_tx.send(Completion { ordinal, result }).ok();
        });
        Ok(())
    }

    /// Collects every task that has already completed, without blocking. Returns how
    /// many were collected.
    pub fn process_finished_tasks(&mut self) -> usize {
        let mut collected = 0;
        while let Ok(completion) = self.done_rx.try_recv() {
            self.record_completion(completion);
            collected += 1;
        }
        collected
    }

    /// Blocks until no task is in flight.
    pub fn wait_for_all(&mut self) -> Result<(), SchedulerError> {
        if self.in_flight > 0 {
            log::debug!("waiting for {} in-flight task(s)", self.in_flight);
        }
        while self.in_flight > 0 {
            self.collect_one()?;
        }
        Ok(())
    }

    /// The barrier: drains every in-flight task, then hands `boundary` to the
    /// boundary handler.
    pub fn on_boundary(&mut self, boundary: B) -> Result<(), SchedulerError> {
        self.wait_for_all()?;
        if let Some(failure) = &self.failure {
            return Err(SchedulerError::Task(failure.clone()));
        }
        self.stats.boundaries += 1;
        self.progress.on_boundary(self.stats.boundaries);
        if let Some(handler) = self.boundary_handler.as_mut() {
            handler.handle(&boundary, &self.bank);
        }
        Ok(())
    }

    /// Waits for the last tasks and returns the run statistics, or the first failure.
    pub fn finish(mut self) -> Result<SchedulerStats, SchedulerError> {
        self.wait_for_all()?;
        if let Some(failure) = self.failure.take() {
            return Err(SchedulerError::Task(failure));
        }
        self.progress.on_finish(RunStage::Push);
        log::info!(
            "scheduler finished: {} task(s), {} accepted, {} filtered, peak {} in flight",
            self.stats.completed,
            self.stats.accepted,
            self.stats.filtered,
            self.stats.peak_in_flight
        );
        Ok(std::mem::take(&mut self.stats))
    }

    fn collect_one(&mut self) -> Result<(), SchedulerError> {
        let completion = self
            .done_rx
            .recv()
            .map_err(|_| SchedulerError::ChannelClosed(self.in_flight))?;
        self.record_completion(completion);
        Ok(())
    }

    fn record_completion(&mut self, completion: Completion) {
        self.in_flight -= 1;
        self.stats.completed += 1;
        match completion.result {
            Ok(Outcome::Accepted { value }) => {
                self.stats.accepted += 1;
                self.stats.accepted_value.push(value);
            }
            Ok(Outcome::Filtered) => self.stats.filtered += 1,
            Err(error) => {
                self.stats.failed += 1;
                log::error!("record {} failed: {error}", completion.ordinal);
                if self.failure.is_none() {
                    self.failure = Some(TaskFailure {
                        ordinal: completion.ordinal,
                        error,
                    });
                }
            }
        }
        self.progress.on_record();
    }
}

impl<R, B, P> StreamListener<R, B> for Scheduler<R, B, P>
where
    R: Send + 'static,
    B: 'static,
    P: RecordProcessor<R> + 'static,
{
    type Error = SchedulerError;

    fn on_record(&mut self, record: Ordered<R>) -> Result<(), SchedulerError> {
        self.start_task(record)
    }

    fn on_boundary(&mut self, boundary: B) -> Result<(), SchedulerError> {
        Scheduler::on_boundary(self, boundary)
    }
}

impl<R, B, P> Drop for Scheduler<R, B, P> {
    fn drop(&mut self) {
        // Every submitted record is filled before the scheduler is gone.
        while self.in_flight > 0 {
            match self.done_rx.recv() {
                Ok(_) => self.in_flight -= 1,
                Err(_) => break,
            }
        }
    }
}
