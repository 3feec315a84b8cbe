// ========================================================================================
//
//                    RECOIL EXECUTION MODEL THROUGHPUT BENCHMARK
//
// ========================================================================================
//
// Measures events per second through the pull model (private banks, merged at the
// end) and the push model (one task per event, shared locked bank) at a few levels
// of concurrency. Events are generated once, kept in memory, and re-read from a
// cursor on every iteration so that file I/O does not dominate.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use recoil::analysis::RecoilAnalysis;
use recoil::config::RunConfig;
use recoil::event::{Event, RunHeader};
use recoil::generate::{GeneratorSettings, write_event_file};
use recoil::pipeline::{PipelineSettings, PullPipeline};
use recoil::scheduler::{Scheduler, drive};
use recoil::source::EventFileReader;
use std::io::Cursor;
use std::sync::Arc;

// --- Benchmark Tuning Parameters ---

/// Events in the in-memory event file.
const NUM_EVENTS: u64 = 20_000;
/// Workers (pull) and tasks in flight (push) to compare.
const CONCURRENCY: [usize; 3] = [1, 2, 4];

fn event_bytes() -> Arc<Vec<u8>> {
    let settings = GeneratorSettings {
        events: NUM_EVENTS,
        runs: 4,
        ..GeneratorSettings::default()
    };
    let mut bytes = Vec::new();
    write_event_file(&settings, &mut bytes).expect("generate benchmark events");
    Arc::new(bytes)
}

fn reader(bytes: &Arc<Vec<u8>>) -> EventFileReader {
    EventFileReader::from_reader("bench", Cursor::new(bytes.as_ref().clone()))
}

fn benchmark_execution_models(c: &mut Criterion) {
    let bytes = event_bytes();
    let config = RunConfig::default();
    let template = config.build_bank().expect("default histograms");

    let mut group = c.benchmark_group("Execution Models: Pull vs. Push");
    group.throughput(Throughput::Elements(NUM_EVENTS));
    group.sample_size(10);

    for &n in &CONCURRENCY {
        group.bench_with_input(BenchmarkId::new("pull", n), &n, |b, &workers| {
            let analysis =
                RecoilAnalysis::new(config.selection.clone(), &template).expect("analysis");
            let pipeline = PullPipeline::new(PipelineSettings {
                workers,
                queue_capacity: 10,
                max_records: None,
            });
            b.iter(|| {
                let outcome = pipeline
                    .run(reader(&bytes), &analysis, &template)
                    .expect("pull run");
                black_box(outcome.stats.accepted)
            });
        });

        group.bench_with_input(BenchmarkId::new("push", n), &n, |b, &max_tasks| {
            b.iter(|| {
                let bank = Arc::new(template.empty_like());
                let analysis = RecoilAnalysis::new(config.selection.clone(), &bank)
                    .expect("analysis");
                let mut scheduler: Scheduler<Event, RunHeader, RecoilAnalysis> =
                    Scheduler::new(max_tasks, Arc::clone(&bank), Arc::new(analysis))
                        .expect("scheduler");
                drive(reader(&bytes), &mut scheduler, None).expect("push run");
                black_box(scheduler.finish().expect("push run").completed)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_execution_models);
criterion_main!(benches);
