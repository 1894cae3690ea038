pub mod xnat;

use std::path::Path;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::warn;

use crate::model::{ScanRecord, SessionRecord};

pub use xnat::XnatClient;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ArchiveError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            ArchiveError::NotFound(err.to_string())
        } else {
            ArchiveError::Transport(err.to_string())
        }
    }
}

/// Project selector for session queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectFilter {
    Exact(String),
    /// SQL `LIKE` style: `%` matches any run, `_` one character.
    Like(String),
}

impl ProjectFilter {
    /// Patterns containing `%` are treated as `LIKE`, anything else as a name.
    pub fn parse(pattern: &str) -> ProjectFilter {
        if pattern.contains('%') {
            ProjectFilter::Like(pattern.to_string())
        } else {
            ProjectFilter::Exact(pattern.to_string())
        }
    }

    /// Value for XNAT's `project` query parameter. XNAT only knows the `*`
    /// wildcard, so both `LIKE` wildcards widen to it and [`Self::matches`]
    /// narrows the result again.
    pub fn server_pattern(&self) -> String {
        match self {
            ProjectFilter::Exact(name) => name.clone(),
            ProjectFilter::Like(pattern) => pattern.replace(['%', '_'], "*"),
        }
    }

    pub fn matches(&self, project: &str) -> bool {
        match self {
            ProjectFilter::Exact(name) => name == project,
            ProjectFilter::Like(pattern) => like_to_glob(pattern)
                .map(|glob| glob.matches(project))
                .unwrap_or(false),
        }
    }
}

fn like_to_glob(pattern: &str) -> Option<glob::Pattern> {
    let mut translated = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '%' => translated.push('*'),
            '_' => translated.push('?'),
            '*' | '?' | '[' | ']' => {
                translated.push('[');
                translated.push(c);
                translated.push(']');
            }
            _ => translated.push(c),
        }
    }
    glob::Pattern::new(&translated).ok()
}

#[derive(Debug, Clone)]
pub struct SessionFilter {
    pub project: ProjectFilter,
    pub subject_label: Option<String>,
    pub inserted_after: Option<NaiveDate>,
}

impl SessionFilter {
    pub fn project(project: ProjectFilter) -> Self {
        Self {
            project,
            subject_label: None,
            inserted_after: None,
        }
    }

    pub fn with_subject(mut self, label: &str) -> Self {
        self.subject_label = Some(label.to_string());
        self
    }

    pub fn inserted_after(mut self, date: Option<NaiveDate>) -> Self {
        self.inserted_after = date;
        self
    }

    /// Client-side check, shared by implementations that cannot filter remotely.
    pub fn accepts(&self, session: &SessionRecord) -> bool {
        if !self.project.matches(&session.project) {
            return false;
        }
        if let Some(label) = &self.subject_label {
            if &session.subject_label != label {
                return false;
            }
        }
        match (self.inserted_after, session.insert_date.as_deref()) {
            (Some(bound), Some(inserted)) => match parse_insert_date(inserted) {
                Some(date) => date >= bound,
                None => {
                    warn!(
                        "Unreadable insert date '{}' on session {}, keeping it",
                        inserted, session.session_id
                    );
                    true
                }
            },
            _ => true,
        }
    }
}

/// Archives report insert dates as `2012-01-05 13:00:00.0` or `20120105`.
pub fn parse_insert_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.trim().split([' ', 'T']).next()?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(day, "%Y%m%d"))
        .ok()
}

/// Operations the synchronizer needs from an imaging archive.
pub trait Archive {
    fn find_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>, ArchiveError>;

    fn scans(&self, session: &SessionRecord) -> Result<Vec<ScanRecord>, ArchiveError>;

    /// Names of the DICOM files stored for a series.
    fn scan_files(&self, session: &SessionRecord, series: &str)
        -> Result<Vec<String>, ArchiveError>;

    fn download_file(
        &self,
        session: &SessionRecord,
        series: &str,
        file_name: &str,
        dest: &Path,
    ) -> Result<(), ArchiveError>;

    /// Records a corrected scan type (`type` and `corrected_type`).
    fn set_scan_type(
        &self,
        session: &SessionRecord,
        series: &str,
        scan_type: &str,
    ) -> Result<(), ArchiveError>;

    fn session_field_strength(&self, session: &SessionRecord)
        -> Result<Option<String>, ArchiveError>;

    fn set_session_field_strength(
        &self,
        session: &SessionRecord,
        value: &str,
    ) -> Result<(), ArchiveError>;

    fn subject_exists(&self, project: &str, subject_label: &str) -> Result<bool, ArchiveError>;

    fn create_subject(&self, project: &str, subject_label: &str) -> Result<(), ArchiveError>;
}

/// Download every DICOM file of a series into `dest`, returning the count.
pub fn download_series(
    archive: &dyn Archive,
    session: &SessionRecord,
    series: &str,
    dest: &Path,
) -> Result<usize, ArchiveError> {
    let files = archive.scan_files(session, series)?;
    for file_name in &files {
        archive.download_file(session, series, file_name, &dest.join(file_name))?;
    }
    Ok(files.len())
}
