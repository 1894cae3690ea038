use std::sync::Mutex;
use std::time::Duration;

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use xnat_sync::convert::ScanOutcome;
use xnat_sync::model::SessionRecord;
use xnat_sync::transfer::TransferOutcome;
use xnat_sync::ProgressReporter;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter using indicatif progress bars.
///
/// - Task start: spinner (session count unknown until queried)
/// - Session: progress bar over its scans
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn set_bar(&self, pb: ProgressBar) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(old) = guard.take() {
                old.finish_and_clear();
            }
            *guard = Some(pb);
        }
    }

    fn finish_bar(&self) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_and_clear();
            }
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(pb) = guard.as_ref() {
                f(pb);
            }
        }
    }
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars(TICK_CHARS),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

impl ProgressReporter for CliReporter {
    fn on_task_start(&self, description: &str) {
        self.set_bar(spinner(format!("{}: querying sessions...", description)));
    }

    fn on_session_start(&self, session: &SessionRecord, scans: usize) {
        let pb = ProgressBar::new(scans as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "  {spinner:.cyan} {msg} [{bar:30.cyan/dim}] {pos}/{len} scans",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━╸─")
            .tick_chars(TICK_CHARS),
        );
        pb.set_message(format!("{}/{}", session.subject_label, session.label));
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_scan_complete(&self, _session: &SessionRecord, _series: &str, _outcome: &ScanOutcome) {
        self.with_bar(|pb| pb.inc(1));
    }

    fn on_session_complete(&self, session: &SessionRecord) {
        self.finish_bar();
        eprintln!(
            "  {} {} {}/{}",
            "✓".green(),
            session.project,
            session.subject_label,
            session.label
        );
    }

    fn on_transfer_complete(&self, session: &SessionRecord, outcome: &TransferOutcome) {
        let status = match outcome {
            TransferOutcome::Transferred { session_id, .. } => {
                format!("transferred as {}", session_id).green()
            }
            TransferOutcome::AlreadyPresent { bucket } => format!("present in {}", bucket).dimmed(),
            TransferOutcome::SkippedSubject(subject) => {
                format!("skipped subject {}", subject).yellow()
            }
            TransferOutcome::Failed(_) => "FAILED".red(),
        };
        self.with_bar(|pb| {
            pb.println(format!(
                "  {}/{}: {}",
                session.subject_label, session.label, status
            ))
        });
    }

    fn on_task_complete(&self, sessions: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  {} Task complete: {} sessions in {:.2}s",
            "✓".green(),
            sessions,
            duration_secs
        );
    }
}
