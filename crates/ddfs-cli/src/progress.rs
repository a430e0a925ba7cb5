//! Terminal progress for audit runs.

use ddfs_audit::{EventLevel, EventLog, EventSink};
use indicatif::{ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str = "{spinner:.cyan} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// Event sink that records into an [`EventLog`] and drives a progress bar
pub struct ProgressSink {
    log: EventLog,
    bar: Option<ProgressBar>,
    quiet: bool,
}

impl ProgressSink {
    pub fn new(quiet: bool) -> Self {
        Self {
            log: EventLog::new(),
            bar: None,
            quiet,
        }
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    fn new_bar(&self, len: u64) -> ProgressBar {
        if self.quiet {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len);
        bar.set_style(
            ProgressStyle::with_template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar
    }
}

impl EventSink for ProgressSink {
    fn start(&mut self, event_type: &str, message: &str, max_count: u64) {
        self.log.start(event_type, message, max_count);
        let bar = self.new_bar(max_count);
        bar.set_message(event_type.to_lowercase());
        self.bar = Some(bar);
    }

    fn progress(&mut self, delta: u64) {
        self.log.progress(delta);
        if let Some(bar) = &self.bar {
            bar.inc(delta);
        }
    }

    fn end(&mut self, message: &str, level: EventLevel) {
        self.log.end(message, level);
        if let Some(bar) = self.bar.take() {
            match level {
                EventLevel::Info => bar.finish_and_clear(),
                _ => bar.abandon(),
            }
        }
    }
}
