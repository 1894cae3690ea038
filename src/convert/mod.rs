pub mod dicom;
pub mod handlers;
pub mod naming;
pub mod tools;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::archive::{self, Archive};
use crate::classify::{classify, Category, Rejection, WhiteList};
use crate::model::{ScanRecord, SessionRecord};
use self::dicom::DicomInspector;
use self::naming::{dwi_label, dwi_volumes, Extension, OutputName, Usability};
use self::tools::ConversionTools;

pub use handlers::HandlerResult;

/// Terminal state of one (session, series) pass through the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// Dropped by the classifier; never downloaded.
    Rejected(Rejection),
    /// Every expected output already existed. `renamed` counts files whose
    /// usability prefix was reconciled.
    UpToDate {
        renamed: usize,
        corrected_type: Option<String>,
    },
    Converted(HandlerResult),
    Failed(String),
}

impl ScanOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ScanOutcome::Failed(_))
            || matches!(self, ScanOutcome::Converted(r) if !r.failures.is_empty())
    }
}

/// Per-scan context handed to the category handlers.
pub struct ScanJob<'a> {
    pub session: &'a SessionRecord,
    pub scan: &'a ScanRecord,
    pub names: OutputName<'a>,
    pub out_dir: &'a Path,
    pub dicom_dir: &'a Path,
}

/// Category-based conversion of single scans into the destination tree.
pub struct Dispatcher<'a> {
    archive: &'a dyn Archive,
    tools: &'a dyn ConversionTools,
    inspector: &'a dyn DicomInspector,
    whitelist: &'a WhiteList,
    scratch_dir: Option<PathBuf>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        archive: &'a dyn Archive,
        tools: &'a dyn ConversionTools,
        inspector: &'a dyn DicomInspector,
        whitelist: &'a WhiteList,
    ) -> Self {
        Self {
            archive,
            tools,
            inspector,
            whitelist,
            scratch_dir: None,
        }
    }

    /// Create temporary directories under `dir` instead of the system default.
    pub fn with_scratch_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.scratch_dir = dir;
        self
    }

    pub(crate) fn scratch(&self, prefix: &str) -> io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        match &self.scratch_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
    }

    /// Run one scan through classification, reconciliation, download and
    /// conversion. Every failure is contained in the returned outcome.
    pub fn process_scan(
        &self,
        session: &SessionRecord,
        scan: &ScanRecord,
        out_dir: &Path,
    ) -> ScanOutcome {
        let series = scan.series.as_str();
        let category = match classify(&scan.scan_type, self.whitelist) {
            Ok(category) => category,
            Err(rejection) => {
                match &rejection {
                    Rejection::Excluded(category) => debug!(
                        "Skipping {},{} because it is a {} series",
                        session.label, series, category
                    ),
                    Rejection::NotWhitelisted => info!(
                        "Scan type '{}' not in the whitelist, skipping {},{}",
                        scan.scan_type, session.label, series
                    ),
                }
                return ScanOutcome::Rejected(rejection);
            }
        };

        let usability = Usability::from_quality(&scan.quality);
        if !usability.is_usable() {
            info!("{},{} has been labeled unusable", session.label, series);
        }
        let names = OutputName::new(session, series, usability);

        let renamed = match naming::reconcile_usability(out_dir, series, usability) {
            Ok(renamed) => renamed,
            Err(e) => {
                error!("Error reconciling outputs of {},{}: {}", session.label, series, e);
                return ScanOutcome::Failed(format!("reconcile failed: {}", e));
            }
        };

        if let Some(outcome) = self.up_to_date(category, session, scan, &names, out_dir, renamed) {
            return outcome;
        }

        debug!("Downloading {},{}", session.label, series);
        let download = match self.download(session, series) {
            Ok(dir) => dir,
            Err(e) => {
                error!("Error downloading {},{}: {}", session.label, series, e);
                return ScanOutcome::Failed(format!("download failed: {}", e));
            }
        };

        let job = ScanJob {
            session,
            scan,
            names,
            out_dir,
            dicom_dir: download.path(),
        };
        let result = match category {
            Category::Pd => self.convert_pd(&job),
            Category::Dwi => self.convert_dwi(&job),
            Category::T1 => self.convert_t1(&job),
            Category::Generic | Category::T2 => self.convert_generic(&job),
            Category::Localizer | Category::NonImage => {
                Err(crate::Error::Other(format!("{} series cannot be converted", category)))
            }
        };

        info!("Deleting the temporary download directory: {}", download.path().display());
        drop(download);

        match result {
            Ok(result) if result.outputs.is_empty() && !result.failures.is_empty() => {
                ScanOutcome::Failed(result.failures.join("; "))
            }
            Ok(result) => ScanOutcome::Converted(result),
            Err(e) => {
                warn!("Skipping {},{}: {}", session.label, series, e);
                ScanOutcome::Failed(e.to_string())
            }
        }
    }

    fn download(&self, session: &SessionRecord, series: &str) -> Result<TempDir, crate::Error> {
        let dir = self.scratch("series-")?;
        let count = archive::download_series(self.archive, session, series, dir.path())?;
        debug!("Downloaded {} files to {}", count, dir.path().display());
        Ok(dir)
    }

    /// Idempotency check before any download or converter call.
    fn up_to_date(
        &self,
        category: Category,
        session: &SessionRecord,
        scan: &ScanRecord,
        names: &OutputName<'_>,
        out_dir: &Path,
        renamed: usize,
    ) -> Option<ScanOutcome> {
        if category == Category::Dwi {
            let found =
                match naming::existing_outputs(out_dir, &scan.series, Some(Extension::Nrrd)) {
                    Ok(found) => found,
                    Err(e) => {
                        error!("Error listing outputs in {}: {}", out_dir.display(), e);
                        return Some(ScanOutcome::Failed(format!(
                            "listing outputs failed: {}",
                            e
                        )));
                    }
                };
            let mut labeled = None;
            for path in found {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match dwi_volumes(&name) {
                    Some(volumes) => {
                        if labeled.is_none() {
                            labeled = Some((path, volumes));
                        }
                    }
                    // Left behind by an interrupted conversion.
                    None => {
                        warn!("{} carries no volume count, removing it", path.display());
                        if let Err(e) = fs::remove_file(&path) {
                            error!("Error removing {}: {}", path.display(), e);
                            return Some(ScanOutcome::Failed(format!(
                                "cannot remove stale {}: {}",
                                path.display(),
                                e
                            )));
                        }
                    }
                }
            }
            let (existing, volumes) = labeled?;
            info!("{} already exists, no conversion needed", existing.display());
            let corrected_type = match self.write_back_type(session, scan, &dwi_label(volumes)) {
                Ok(corrected) => corrected,
                Err(message) => return Some(ScanOutcome::Failed(message)),
            };
            return Some(ScanOutcome::UpToDate {
                renamed,
                corrected_type,
            });
        }

        let expected = handlers::expected_outputs(category, &scan.scan_type, names, out_dir);
        if !expected.is_empty() && expected.iter().all(|path| path.exists()) {
            info!("{},{} has already been converted", session.label, scan.series);
            return Some(ScanOutcome::UpToDate {
                renamed,
                corrected_type: None,
            });
        }
        None
    }

    /// Write a corrected scan type through to the archive when it differs
    /// from the recorded one.
    pub(crate) fn write_back_type(
        &self,
        session: &SessionRecord,
        scan: &ScanRecord,
        corrected: &str,
    ) -> Result<Option<String>, String> {
        if corrected == scan.scan_type {
            return Ok(None);
        }
        info!(
            "Updating scan type of {},{} from '{}' to '{}'",
            session.label, scan.series, scan.scan_type, corrected
        );
        self.archive
            .set_scan_type(session, &scan.series, corrected)
            .map(|_| Some(corrected.to_string()))
            .map_err(|e| {
                error!("Error updating scan type of {},{}: {}", session.label, scan.series, e);
                format!("type write-back failed: {}", e)
            })
    }
}
