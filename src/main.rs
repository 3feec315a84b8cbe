// ========================================================================================
//
//                           THE COMMAND-LINE FRONT END: RECOIL
//
// ========================================================================================
//
// Parses arguments, loads the run configuration and hands an event file to one of
// the two execution models. Everything that can fail returns an error up to `main`,
// which prints a single line and exits non-zero.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use itertools::Itertools;
use recoil::analysis::RecoilAnalysis;
use recoil::bank::HistogramBank;
use recoil::config::{MAX_THREADS_ENV, RunConfig};
use recoil::event::{Event, RunHeader};
use recoil::generate::{GeneratorSettings, write_event_file};
use recoil::pipeline::{PipelineSettings, PullPipeline};
use recoil::progress::{ProgressObserver, TerminalProgress};
use recoil::report::RunReport;
use recoil::scheduler::{Scheduler, drive};
use recoil::source::EventFileReader;
use std::error::Error;
use std::fs;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Producer thread, bounded queue and a fixed worker pool with private banks
    Pull,
    /// One task per record on a bounded task pool sharing a locked bank
    Push,
}

#[derive(Args)]
struct RunArgs {
    /// JSON-lines event file to analyse
    #[arg(value_name = "EVENT_FILE")]
    input: PathBuf,

    /// Run configuration (.toml); built-in defaults otherwise
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Mode::Pull)]
    mode: Mode,

    /// Directory for summary.toml and the histogram CSVs
    #[arg(long, default_value = "recoil_output")]
    output: PathBuf,

    /// Stop after this many events
    #[arg(long)]
    max_records: Option<u64>,

    /// Pull model: number of workers
    #[arg(long)]
    workers: Option<usize>,

    /// Pull model: queue capacity
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Push model: maximum tasks in flight (otherwise RECOIL_MAX_THREADS, the
    /// config file, or the number of CPUs)
    #[arg(long)]
    threads: Option<usize>,
}

#[derive(Args)]
struct GenerateArgs {
    /// Where to write the event file
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    #[arg(long, default_value = "10000")]
    events: u64,

    #[arg(long, default_value = "1")]
    runs: u32,

    #[arg(long, default_value = "42")]
    seed: u64,

    /// Centre-of-mass energy in GeV
    #[arg(long, default_value = "250.0")]
    sqrt_s: f64,

    /// Fraction of events generated to fail the selection
    #[arg(long, default_value = "0.1")]
    off_selection: f64,
}

#[derive(Parser)]
#[command(
    name = "recoil",
    about = "Concurrent Higgs-recoil histogramming over collider event files",
    long_about = "Streams events from a JSON-lines file through a bounded pool of workers, \
                 fills muon-pair, jet-pair and recoil mass histograms and writes them as CSV."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Histogram an event file (outputs: summary.toml, <histogram>.csv)")]
    Run(RunArgs),

    #[command(about = "Write a synthetic ee -> ZH -> mu mu j j event file")]
    Generate(GenerateArgs),

    #[command(about = "Print the default run configuration, or write it to a file")]
    Config {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },

    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Generate(args)) => generate(args),
        Some(Commands::Config { path }) => write_default_config(path),
        Some(Commands::Version) => {
            println!("recoil {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map_err(|e| Box::new(e) as Box<dyn Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => {
            eprintln!("> Loading configuration from {}", path.display());
            RunConfig::load(path)?
        }
        None => RunConfig::default(),
    };
    if let Some(n) = args.max_records {
        config.max_records = Some(n);
    }
    if let Some(n) = args.workers {
        config.workers = n;
    }
    if let Some(n) = args.queue_capacity {
        config.queue_capacity = n;
    }
    config.validate()?;

    let template = config.build_bank()?;
    let source = EventFileReader::open(&args.input)?
        .with_collections(&config.selection.collections());
    let progress: Arc<dyn ProgressObserver> = Arc::new(TerminalProgress::new());
    eprintln!(
        "> Histogramming {} with the {:?} model",
        args.input.display(),
        args.mode
    );

    let start = Instant::now();
    let report = match args.mode {
        Mode::Pull => {
            let analysis = RecoilAnalysis::new(config.selection.clone(), &template)?;
            let pipeline = PullPipeline::new(PipelineSettings::from(&config)).with_progress(progress);
            eprintln!(
                "> {} worker(s), queue capacity {}",
                pipeline.settings().workers,
                pipeline.settings().queue_capacity
            );
            pipeline
                .run(source, &analysis, &template)?
                .report(start.elapsed())
        }
        Mode::Push => {
            let max_tasks = args
                .threads
                .unwrap_or_else(|| config.max_threads_from_env());
            eprintln!(
                "> Up to {max_tasks} task(s) in flight (override with --threads or {MAX_THREADS_ENV})"
            );
            let bank = Arc::new(template);
            let analysis = Arc::new(RecoilAnalysis::new(config.selection.clone(), &bank)?);
            let mut scheduler: Scheduler<Event, RunHeader, RecoilAnalysis> =
                Scheduler::new(max_tasks, Arc::clone(&bank), analysis)?
                    .with_progress(progress)
                    .with_boundary_handler(log_run_header);
            drive(source, &mut scheduler, config.max_records)?;
            scheduler
                .finish()?
                .report(max_tasks, &bank, start.elapsed())
        }
    };

    print_report(&report);
    let written = report.write_to_dir(&args.output)?;
    eprintln!(
        "> Wrote {} file(s) to {}",
        written.len(),
        args.output.display()
    );
    Ok(())
}

/// Called at every run header, after all earlier events have been filled.
fn log_run_header(header: &RunHeader, bank: &HistogramBank) {
    let filled: u64 = bank.snapshot_all().iter().map(|h| h.entries).sum();
    log::info!(
        "run {} ({}): {} [{}]; {} fill(s) so far",
        header.run_number,
        header.detector_name,
        header.description,
        header
            .parameters
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .join(", "),
        filled
    );
}

fn print_report(report: &RunReport) {
    eprintln!("> {}", report.headline());
    eprintln!(
        ">   {} read, {} accepted, {} filtered, {} run header(s), {:.2}s",
        report.counts.records_read,
        report.counts.accepted,
        report.counts.filtered,
        report.counts.boundaries,
        report.elapsed.as_secs_f64()
    );
    for histogram in &report.histograms {
        eprintln!(
            ">   {:<12} entries {:>8}  mean {:>9.3}  rms {:>8.3}",
            histogram.name, histogram.entries, histogram.mean, histogram.rms
        );
    }
}

fn generate(args: GenerateArgs) -> Result<(), Box<dyn Error>> {
    let settings = GeneratorSettings {
        events: args.events,
        runs: args.runs,
        seed: args.seed,
        sqrt_s: args.sqrt_s,
        off_selection_fraction: args.off_selection,
    };
    let file = BufWriter::new(fs::File::create(&args.output)?);
    let summary = write_event_file(&settings, file)?;
    eprintln!(
        "> Wrote {} event(s) in {} run(s) to {}",
        summary.events,
        summary.runs,
        args.output.display()
    );
    Ok(())
}

fn write_default_config(path: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let config = RunConfig::default();
    match path {
        Some(path) => {
            config.save(&path)?;
            eprintln!("> Wrote default configuration to {}", path.display());
        }
        None => print!("{}", toml::to_string_pretty(&config)?),
    }
    Ok(())
}
