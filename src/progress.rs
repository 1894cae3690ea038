use crate::convert::ScanOutcome;
use crate::model::SessionRecord;
use crate::transfer::TransferOutcome;

/// Trait for reporting sync progress.
///
/// The CLI implements it with indicatif. All methods have default no-op
/// implementations.
pub trait ProgressReporter {
    fn on_task_start(&self, _description: &str) {}
    fn on_session_start(&self, _session: &SessionRecord, _scans: usize) {}
    fn on_scan_complete(&self, _session: &SessionRecord, _series: &str, _outcome: &ScanOutcome) {}
    fn on_session_complete(&self, _session: &SessionRecord) {}
    fn on_transfer_complete(&self, _session: &SessionRecord, _outcome: &TransferOutcome) {}
    fn on_task_complete(&self, _sessions: usize, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
