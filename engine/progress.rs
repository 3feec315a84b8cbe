use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt;
use std::io::IsTerminal;
use std::time::Duration;

/// Which execution model is reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunStage {
    Pull,
    Push,
}

impl RunStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Pull => "pull-model histogramming",
            Self::Push => "push-model histogramming",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for incremental progress of a run.
///
/// Called concurrently from worker threads and pool tasks, so implementations take
/// `&self` and must be `Sync`.
pub trait ProgressObserver: Send + Sync {
    fn on_start(&self, stage: RunStage, limit: Option<u64>) {
        let _ = (stage, limit);
    }
    fn on_record(&self) {}
    /// A boundary record was reached; `boundaries` counts them from the start of the
    /// run.
    fn on_boundary(&self, boundaries: u64) {
        let _ = boundaries;
    }
    fn on_finish(&self, stage: RunStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}

/// A progress bar on stderr; hidden when stderr is not a terminal.
pub struct TerminalProgress {
    bar: ProgressBar,
}

impl TerminalProgress {
    pub fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            bar: ProgressBar::with_draw_target(None, draw_target),
        }
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for TerminalProgress {
    fn on_start(&self, stage: RunStage, limit: Option<u64>) {
        let template = match limit {
            Some(len) => {
                self.bar.set_length(len);
                "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} records {msg}"
            }
            None => "> [{elapsed_precise}] {spinner} {pos} records ({per_sec}) {msg}",
        };
        // The templates are constants; a parse failure keeps the default style.
        if let Ok(style) = ProgressStyle::with_template(template) {
            self.bar
                .set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        self.bar.set_message(stage.describe());
        self.bar.enable_steady_tick(Duration::from_millis(100));
    }

    fn on_record(&self) {
        self.bar.inc(1);
    }

    fn on_boundary(&self, boundaries: u64) {
        self.bar.set_message(format!("boundary {boundaries}"));
    }

    fn on_finish(&self, stage: RunStage) {
        self.bar
            .finish_with_message(format!("{} complete", stage.describe()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Counting(AtomicU64);

    impl ProgressObserver for Counting {
        fn on_record(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn default_methods_are_no_ops() {
        let observer = Counting::default();
        observer.on_start(RunStage::Pull, Some(3));
        observer.on_boundary(1);
        observer.on_record();
        observer.on_finish(RunStage::Pull);
        assert_eq!(observer.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn stages_describe_themselves() {
        assert_eq!(RunStage::Push.to_string(), "push-model histogramming");
    }
}
