use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::archive::Archive;
use crate::cache::{CacheGuardian, EvictionReport};
use crate::classify::WhiteList;
use crate::convert::dicom::DicomInspector;
use crate::convert::naming::session_output_dir;
use crate::convert::tools::ConversionTools;
use crate::convert::{Dispatcher, ScanOutcome};
use crate::error::Error;
use crate::matcher::{recent_sessions, DicomIdentityProbe, Match, SessionMatcher};
use crate::model::SessionRecord;
use crate::progress::ProgressReporter;
use crate::transfer::identifier::IdentifierService;
use crate::transfer::{project_site, RemapTool, TransferOutcome, TransferPackager, TransferSettings};

/// Mode applied to every session output directory.
pub const SESSION_DIR_MODE: u32 = 0o750;

/// One configured unit of work, run in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum SyncTask {
    /// Copy sessions of a source project missing from the destination.
    Transfer {
        source_project: String,
        destination_project: String,
    },
    /// Convert recent sessions of destination projects matching a pattern.
    Convert { project_pattern: String },
}

impl fmt::Display for SyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTask::Transfer {
                source_project,
                destination_project,
            } => write!(f, "transfer {} -> {}", source_project, destination_project),
            SyncTask::Convert { project_pattern } => write!(f, "convert {}", project_pattern),
        }
    }
}

/// The external systems the engine talks to.
pub struct Collaborators<'a> {
    pub source: &'a dyn Archive,
    pub destination: &'a dyn Archive,
    pub tools: &'a dyn ConversionTools,
    pub inspector: &'a dyn DicomInspector,
    pub identifiers: &'a dyn IdentifierService,
    pub remap: &'a dyn RemapTool,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub destination_base: PathBuf,
    pub legacy_buckets: Vec<String>,
    pub transfer: TransferSettings,
    pub inserted_after: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub series: String,
    pub outcome: ScanOutcome,
}

/// Result of converting one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub session: SessionRecord,
    pub scans: Vec<ScanReport>,
    /// Value written to the session when it had no field strength.
    pub field_strength: Option<String>,
    /// Set when the session could not be processed at all.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    pub session: SessionRecord,
    pub outcome: TransferOutcome,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub conversions: Vec<SessionReport>,
    pub transfers: Vec<TransferReport>,
    pub evictions: EvictionReport,
    pub duration: Duration,
}

impl SyncReport {
    pub fn converted_scans(&self) -> usize {
        self.scan_outcomes()
            .filter(|o| matches!(o, ScanOutcome::Converted(_)))
            .count()
    }

    pub fn failed_scans(&self) -> usize {
        self.scan_outcomes().filter(|o| o.is_failure()).count()
    }

    pub fn transferred(&self) -> usize {
        self.transfers
            .iter()
            .filter(|t| matches!(t.outcome, TransferOutcome::Transferred { .. }))
            .count()
    }

    pub fn failed_transfers(&self) -> usize {
        self.transfers
            .iter()
            .filter(|t| matches!(t.outcome, TransferOutcome::Failed(_)))
            .count()
    }

    pub fn has_failures(&self) -> bool {
        self.failed_scans() > 0
            || self.failed_transfers() > 0
            || self.conversions.iter().any(|s| s.error.is_some())
    }

    fn scan_outcomes(&self) -> impl Iterator<Item = &ScanOutcome> {
        self.conversions
            .iter()
            .flat_map(|s| s.scans.iter().map(|scan| &scan.outcome))
    }

    /// Plain-text summary used for the run notification.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Sessions transferred: {} ({} failed, {} already present)\n",
            self.transferred(),
            self.failed_transfers(),
            self.transfers
                .iter()
                .filter(|t| matches!(t.outcome, TransferOutcome::AlreadyPresent { .. }))
                .count()
        ));
        out.push_str(&format!(
            "Sessions converted: {} ({} scans converted, {} failed)\n",
            self.conversions.len(),
            self.converted_scans(),
            self.failed_scans()
        ));
        out.push_str(&format!(
            "Cache eviction: {} files, {} bytes\n",
            self.evictions.files_deleted, self.evictions.bytes_freed
        ));
        for transfer in &self.transfers {
            if let TransferOutcome::Failed(reason) = &transfer.outcome {
                out.push_str(&format!(
                    "FAILED transfer {},{}: {}\n",
                    transfer.session.subject_label, transfer.session.label, reason
                ));
            }
        }
        for session in &self.conversions {
            if let Some(reason) = &session.error {
                out.push_str(&format!("FAILED session {}: {}\n", session.session.label, reason));
            }
            for scan in session.scans.iter().filter(|s| s.outcome.is_failure()) {
                out.push_str(&format!(
                    "FAILED scan {},{}\n",
                    session.session.label, scan.series
                ));
            }
        }
        out
    }
}

pub struct SyncEngine<'a> {
    with: Collaborators<'a>,
    whitelist: WhiteList,
    settings: EngineSettings,
    source_cache: Option<CacheGuardian>,
    destination_cache: Option<CacheGuardian>,
}

impl<'a> SyncEngine<'a> {
    pub fn new(with: Collaborators<'a>, whitelist: WhiteList, settings: EngineSettings) -> Self {
        Self {
            with,
            whitelist,
            settings,
            source_cache: None,
            destination_cache: None,
        }
    }

    /// Guard the local caches of both archives. Scratch downloads are placed
    /// in the guarded directories.
    pub fn with_caches(
        mut self,
        source: Option<CacheGuardian>,
        destination: Option<CacheGuardian>,
    ) -> Self {
        self.source_cache = source;
        self.destination_cache = destination;
        self
    }

    /// Run every task in order. Errors from a single scan or transfer are
    /// recorded in the report; archive query failures abort the run.
    pub fn run(
        &self,
        tasks: &[SyncTask],
        reporter: &dyn ProgressReporter,
    ) -> Result<SyncReport, Error> {
        let start = Instant::now();
        let mut report = SyncReport::default();
        for task in tasks {
            info!("Starting task: {}", task);
            reporter.on_task_start(&task.to_string());
            let task_start = Instant::now();
            let sessions = match task {
                SyncTask::Transfer {
                    source_project,
                    destination_project,
                } => self.run_transfer(source_project, destination_project, &mut report, reporter)?,
                SyncTask::Convert { project_pattern } => {
                    self.run_convert(project_pattern, &mut report, reporter)?
                }
            };
            let elapsed = task_start.elapsed();
            debug!(
                "Task {} completed in {:.2}s, {} sessions",
                task,
                elapsed.as_secs_f64(),
                sessions
            );
            reporter.on_task_complete(sessions, elapsed.as_secs_f64());
        }
        report.duration = start.elapsed();
        Ok(report)
    }

    fn run_transfer(
        &self,
        source_project: &str,
        destination_project: &str,
        report: &mut SyncReport,
        reporter: &dyn ProgressReporter,
    ) -> Result<usize, Error> {
        project_site(destination_project)?;

        let probe = DicomIdentityProbe::new(self.with.source, self.with.inspector);
        let matcher = SessionMatcher::new(
            self.with.source,
            self.with.destination,
            &probe,
            self.settings.legacy_buckets.clone(),
        );
        let packager = TransferPackager::new(
            self.with.source,
            self.with.destination,
            self.with.identifiers,
            self.with.remap,
            self.settings.transfer.clone(),
        )
        .with_scratch_dir(cache_dir(&self.source_cache));

        let mut count = 0;
        for found in matcher.new_sessions(
            source_project,
            destination_project,
            self.settings.inserted_after,
        )? {
            check_cache(&self.source_cache, report);
            let (session, outcome) = match found? {
                Match::Present { session, bucket } => {
                    (session, TransferOutcome::AlreadyPresent { bucket })
                }
                Match::New(candidate) => {
                    let outcome = packager.transfer(&candidate, destination_project);
                    (candidate.session, outcome)
                }
                Match::Unidentified { session, reason } => {
                    (session, TransferOutcome::Failed(reason))
                }
            };
            reporter.on_transfer_complete(&session, &outcome);
            report.transfers.push(TransferReport { session, outcome });
            count += 1;
        }
        Ok(count)
    }

    fn run_convert(
        &self,
        project_pattern: &str,
        report: &mut SyncReport,
        reporter: &dyn ProgressReporter,
    ) -> Result<usize, Error> {
        let dispatcher = Dispatcher::new(
            self.with.destination,
            self.with.tools,
            self.with.inspector,
            &self.whitelist,
        )
        .with_scratch_dir(cache_dir(&self.destination_cache));

        let mut count = 0;
        for session in recent_sessions(
            self.with.destination,
            project_pattern,
            self.settings.inserted_after,
        )? {
            check_cache(&self.destination_cache, report);
            let session_report = self.convert_session(&dispatcher, session, reporter);
            report.conversions.push(session_report);
            count += 1;
        }
        Ok(count)
    }

    /// Convert every scan of one session into its output directory, then
    /// fix the directory mode and the session field strength.
    pub fn convert_session(
        &self,
        dispatcher: &Dispatcher<'_>,
        session: SessionRecord,
        reporter: &dyn ProgressReporter,
    ) -> SessionReport {
        let mut report = SessionReport {
            session,
            scans: Vec::new(),
            field_strength: None,
            error: None,
        };
        let session = &report.session;
        debug!(
            "Syncing session: {}, {}, {}",
            session.project, session.subject_label, session.label
        );

        let out_dir = session_output_dir(&self.settings.destination_base, session);
        if !out_dir.exists() {
            info!("Creating new directory: {}", out_dir.display());
        }
        if let Err(e) = fs::create_dir_all(&out_dir) {
            error!("Error creating {}: {}", out_dir.display(), e);
            report.error = Some(format!("cannot create {}: {}", out_dir.display(), e));
            return report;
        }

        let scans = match self.with.destination.scans(session) {
            Ok(scans) => scans,
            Err(e) => {
                error!("Error listing scans of {}: {}", session.label, e);
                report.error = Some(e.to_string());
                return report;
            }
        };
        reporter.on_session_start(session, scans.len());

        let mut field_strength = None;
        let mut scan_reports = Vec::with_capacity(scans.len());
        for scan in &scans {
            let outcome = dispatcher.process_scan(session, scan, &out_dir);
            if field_strength.is_none() && !matches!(outcome, ScanOutcome::Rejected(_)) {
                field_strength = scan
                    .field_strength
                    .clone()
                    .filter(|value| !value.trim().is_empty());
            }
            reporter.on_scan_complete(session, &scan.series, &outcome);
            scan_reports.push(ScanReport {
                series: scan.series.clone(),
                outcome,
            });
        }

        if let Err(e) = restrict_permissions(&out_dir) {
            error!("Error updating permissions on {}: {}", out_dir.display(), e);
        }
        let written = self.write_field_strength(session, field_strength);
        reporter.on_session_complete(session);

        report.scans = scan_reports;
        report.field_strength = written;
        report
    }

    fn write_field_strength(&self, session: &SessionRecord, value: Option<String>) -> Option<String> {
        let value = value?;
        match self.with.destination.session_field_strength(session) {
            Ok(Some(current)) if !current.trim().is_empty() => None,
            Ok(_) => {
                info!("Setting field strength of {} to {}", session.label, value);
                match self
                    .with
                    .destination
                    .set_session_field_strength(session, &value)
                {
                    Ok(()) => Some(value),
                    Err(e) => {
                        error!("Error setting field strength of {}: {}", session.label, e);
                        None
                    }
                }
            }
            Err(e) => {
                error!("Error reading field strength of {}: {}", session.label, e);
                None
            }
        }
    }
}

fn cache_dir(guardian: &Option<CacheGuardian>) -> Option<PathBuf> {
    guardian.as_ref().map(|g| g.dir().to_path_buf())
}

fn check_cache(guardian: &Option<CacheGuardian>, report: &mut SyncReport) {
    if let Some(guardian) = guardian {
        report.evictions.merge(guardian.check_and_free());
    }
}

/// Set `dir` to [`SESSION_DIR_MODE`] when it differs. Returns whether the
/// mode was changed.
#[cfg(unix)]
pub fn restrict_permissions(dir: &Path) -> io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(dir)?.permissions().mode() & 0o7777;
    if mode == SESSION_DIR_MODE {
        return Ok(false);
    }
    info!("Updating permissions on {}", dir.display());
    fs::set_permissions(dir, fs::Permissions::from_mode(SESSION_DIR_MODE))?;
    Ok(true)
}

#[cfg(not(unix))]
pub fn restrict_permissions(_dir: &Path) -> io::Result<bool> {
    Ok(false)
}
