use serde::{Deserialize, Serialize};

/// One scanning visit as reported by an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub project: String,
    pub subject_id: String,
    pub subject_label: String,
    pub session_id: String,
    pub label: String,
    /// YYYYMMDD
    pub date: String,
    /// HHMMSS, fractional seconds stripped
    pub time: String,
    pub insert_date: Option<String>,
}

/// One acquisition (series) within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub series: String,
    pub scan_type: String,
    pub quality: String,
    pub field_strength: Option<String>,
}

/// Study-level identity read from a representative DICOM file of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyIdentity {
    pub study_uid: String,
    pub date: String,
    pub time: String,
}

impl StudyIdentity {
    pub fn new(study_uid: &str, date: &str, time: &str) -> Self {
        Self {
            study_uid: study_uid.trim().to_string(),
            date: normalize_date(date),
            time: normalize_time(time),
        }
    }
}

/// `2012-01-05` and `20120105` both normalize to `20120105`.
pub fn normalize_date(raw: &str) -> String {
    raw.trim().replace('-', "")
}

/// Drops `:` separators and any fractional seconds: `13:45:12.250` -> `134512`.
pub fn normalize_time(raw: &str) -> String {
    let whole = raw.trim().split('.').next().unwrap_or_default();
    whole.replace(':', "")
}
