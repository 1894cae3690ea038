pub mod anon;
pub mod identifier;

use std::path::{Path, PathBuf};
use std::process::Command;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, error, info};

use crate::archive::{self, Archive};
use crate::convert::tools::{run_tool, ToolError};
use crate::error::Error;
use crate::matcher::Candidate;
use anon::AnonymizationFields;
use identifier::{IdentifierRequest, IdentifierService};

/// Text in the remap tool's output that marks a failed transmission.
pub const REMAP_ERROR_MARKER: &str = "Exception";

lazy_static! {
    static ref STUDY_SUBJECT: Regex = Regex::new(r"^\d{4}$").unwrap();
}

/// Anonymizes DICOM directories with a script and sends them to a DICOM
/// endpoint. Returns the tool's textual output.
pub trait RemapTool {
    fn transmit(
        &self,
        script: &Path,
        destination: &str,
        dirs: &[PathBuf],
    ) -> Result<String, ToolError>;
}

/// `DicomRemap -d <script> -o <destination> <dir>...`
pub struct DicomRemap {
    command: PathBuf,
}

impl DicomRemap {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl RemapTool for DicomRemap {
    fn transmit(
        &self,
        script: &Path,
        destination: &str,
        dirs: &[PathBuf],
    ) -> Result<String, ToolError> {
        run_tool(
            Command::new(&self.command)
                .arg("-d")
                .arg(script)
                .arg("-o")
                .arg(destination)
                .args(dirs),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    pub remap_command: PathBuf,
    pub base_anon: PathBuf,
    pub dicom_scp: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Transferred { session_id: String, series: usize },
    AlreadyPresent { bucket: String },
    /// Subject unknown to the destination and not a study subject label.
    SkippedSubject(String),
    Failed(String),
}

/// Site code of a destination project: `PHD_024` and `FMRI_HD_024` both give
/// `024`. Only `PHD*` and `FMRI*` projects can receive transfers.
pub fn project_site(project: &str) -> Result<String, Error> {
    let rest = if let Some(rest) = project.strip_prefix("PHD") {
        rest
    } else if let Some(rest) = project.strip_prefix("FMRI") {
        rest.strip_prefix("_HD").unwrap_or(rest)
    } else {
        return Err(Error::InvalidProject(project.to_string()));
    };
    Ok(rest.trim_start_matches('_').to_string())
}

pub struct TransferPackager<'a> {
    source: &'a dyn Archive,
    destination: &'a dyn Archive,
    identifiers: &'a dyn IdentifierService,
    remap: &'a dyn RemapTool,
    settings: TransferSettings,
    scratch_dir: Option<PathBuf>,
}

impl<'a> TransferPackager<'a> {
    pub fn new(
        source: &'a dyn Archive,
        destination: &'a dyn Archive,
        identifiers: &'a dyn IdentifierService,
        remap: &'a dyn RemapTool,
        settings: TransferSettings,
    ) -> Self {
        Self {
            source,
            destination,
            identifiers,
            remap,
            settings,
            scratch_dir: None,
        }
    }

    pub fn with_scratch_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.scratch_dir = dir;
        self
    }

    fn scratch(&self, prefix: &str) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        match &self.scratch_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
    }

    /// Copy one new session into `destination_project`. Either the whole
    /// session is transmitted or the outcome is a failure.
    pub fn transfer(&self, candidate: &Candidate, destination_project: &str) -> TransferOutcome {
        let session = &candidate.session;
        match self.try_transfer(candidate, destination_project) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    critical = true,
                    "Transfer of {},{} to {} failed: {}",
                    session.subject_label,
                    session.label,
                    destination_project,
                    e
                );
                TransferOutcome::Failed(e.to_string())
            }
        }
    }

    fn try_transfer(
        &self,
        candidate: &Candidate,
        destination_project: &str,
    ) -> Result<TransferOutcome, Error> {
        let session = &candidate.session;
        let subject = session.subject_label.as_str();
        let site = project_site(destination_project)?;

        if !self.destination.subject_exists(destination_project, subject)? {
            if !STUDY_SUBJECT.is_match(subject) {
                info!("{},{} goes in the pilot project", subject, session.date);
                return Ok(TransferOutcome::SkippedSubject(subject.to_string()));
            }
            info!("{} does not exist in {}. Creating...", subject, destination_project);
            self.destination.create_subject(destination_project, subject)?;
        }

        let identity = &candidate.identity;
        let session_id = self.identifiers.issue(&IdentifierRequest {
            site: &site,
            subject_label: subject,
            date: &identity.date,
            time: &identity.time,
            study_uid: &identity.study_uid,
        })?;

        info!("Downloading scans of session {}", session.session_id);
        let download_root = self.scratch("session-")?;
        let mut series_dirs = Vec::new();
        for scan in self.source.scans(session)? {
            let dir = download_root.path().join(format!("series-{}", scan.series));
            std::fs::create_dir(&dir)?;
            archive::download_series(self.source, session, &scan.series, &dir)?;
            series_dirs.push(dir);
        }

        info!(
            "Starting upload of {} to project {}",
            session_id, destination_project
        );
        let script_dir = self.scratch("anon-")?;
        let script = anon::write_script(
            &self.settings.base_anon,
            script_dir.path(),
            &AnonymizationFields {
                site: &site,
                project: destination_project,
                subject_label: subject,
                session_id: &session_id,
            },
        )?;

        let output = self
            .remap
            .transmit(&script, &self.settings.dicom_scp, &series_dirs)?;
        debug!("{}", output);
        if output.contains(REMAP_ERROR_MARKER) {
            return Err(Error::Other(format!(
                "An exception occurred while running the dicom remap command. Output follows.\n{}",
                output
            )));
        }

        Ok(TransferOutcome::Transferred {
            session_id,
            series: series_dirs.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_site() {
        assert_eq!(project_site("PHD_024").unwrap(), "024");
        assert_eq!(project_site("FMRI_HD_024").unwrap(), "024");
        assert_eq!(project_site("FMRI_112").unwrap(), "112");
        assert!(matches!(
            project_site("JP_FMRI_HD"),
            Err(Error::InvalidProject(_))
        ));
    }

    #[test]
    fn test_study_subject_labels() {
        assert!(STUDY_SUBJECT.is_match("0001"));
        assert!(!STUDY_SUBJECT.is_match("P001"));
        assert!(!STUDY_SUBJECT.is_match("00012"));
    }
}
