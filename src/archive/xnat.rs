use std::fs;
use std::io;
use std::path::Path;

use reqwest::blocking::{Client, RequestBuilder};
use serde_json::Value;
use tracing::{debug, trace};

use super::{Archive, ArchiveError, SessionFilter};
use crate::model::{normalize_date, normalize_time, ScanRecord, SessionRecord};

const SESSION_COLUMNS: &str =
    "ID,label,project,subject_ID,subject_label,date,time,insert_date";
const SCAN_COLUMNS: &str = "ID,type,quality,xnat:mrScanData/fieldStrength";

/// Blocking XNAT REST client covering the operations of [`Archive`].
pub struct XnatClient {
    base_url: String,
    username: String,
    password: String,
    http: Client,
}

impl XnatClient {
    pub fn new(base_url: &str, username: &str, password: &str) -> Result<Self, ArchiveError> {
        let http = Client::builder().build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/data/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.username, Some(&self.password))
    }

    fn get_results(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<Value>, ArchiveError> {
        let url = self.url(path);
        trace!("GET {} {:?}", url, query);
        let body: Value = self
            .authed(self.http.get(&url))
            .query(&[("format", "json")])
            .query(query)
            .send()?
            .error_for_status()?
            .json()?;
        match body.pointer("/ResultSet/Result") {
            Some(Value::Array(rows)) => Ok(rows.clone()),
            _ => Err(ArchiveError::Decode(format!("{} returned no ResultSet", url))),
        }
    }

    fn put(&self, path: &str, query: &[(&str, &str)]) -> Result<(), ArchiveError> {
        let url = self.url(path);
        debug!("PUT {} {:?}", url, query);
        self.authed(self.http.put(&url))
            .query(query)
            .send()?
            .error_for_status()?;
        Ok(())
    }

    fn scan_path(session: &SessionRecord, series: &str) -> String {
        format!("experiments/{}/scans/{}", session.session_id, series)
    }
}

/// Reads a column from a result row, tolerating the case changes XNAT applies
/// to xsi-qualified column names.
fn column(row: &Value, name: &str) -> String {
    let found = row.get(name).or_else(|| {
        row.as_object().and_then(|map| {
            map.iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
    });
    match found {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn session_from_row(row: &Value) -> SessionRecord {
    SessionRecord {
        project: column(row, "project"),
        subject_id: column(row, "subject_ID"),
        subject_label: column(row, "subject_label"),
        session_id: column(row, "ID"),
        label: column(row, "label"),
        date: normalize_date(&column(row, "date")),
        time: normalize_time(&column(row, "time")),
        insert_date: non_empty(column(row, "insert_date")),
    }
}

impl Archive for XnatClient {
    fn find_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>, ArchiveError> {
        let project = filter.project.server_pattern();
        let mut query = vec![
            ("xsiType", "xnat:mrSessionData"),
            ("columns", SESSION_COLUMNS),
            ("project", project.as_str()),
        ];
        if let Some(subject) = &filter.subject_label {
            query.push(("subject_label", subject.as_str()));
        }
        let rows = self.get_results("experiments", &query)?;
        Ok(rows
            .iter()
            .map(session_from_row)
            .filter(|session| filter.accepts(session))
            .collect())
    }

    fn scans(&self, session: &SessionRecord) -> Result<Vec<ScanRecord>, ArchiveError> {
        let path = format!("experiments/{}/scans", session.session_id);
        let rows = self.get_results(&path, &[("columns", SCAN_COLUMNS)])?;
        Ok(rows
            .iter()
            .map(|row| ScanRecord {
                series: column(row, "ID"),
                scan_type: column(row, "type"),
                quality: column(row, "quality"),
                field_strength: non_empty(column(row, "xnat:mrScanData/fieldStrength")),
            })
            .collect())
    }

    fn scan_files(
        &self,
        session: &SessionRecord,
        series: &str,
    ) -> Result<Vec<String>, ArchiveError> {
        let path = format!("{}/resources/DICOM/files", Self::scan_path(session, series));
        let rows = self.get_results(&path, &[])?;
        Ok(rows
            .iter()
            .map(|row| column(row, "Name"))
            .filter(|name| !name.is_empty())
            .collect())
    }

    fn download_file(
        &self,
        session: &SessionRecord,
        series: &str,
        file_name: &str,
        dest: &Path,
    ) -> Result<(), ArchiveError> {
        let url = self.url(&format!(
            "{}/resources/DICOM/files/{}",
            Self::scan_path(session, series),
            file_name
        ));
        trace!("Downloading {} to {}", url, dest.display());
        let mut response = self
            .authed(self.http.get(&url))
            .send()?
            .error_for_status()?;
        let mut out = fs::File::create(dest)?;
        io::copy(&mut response, &mut out)?;
        Ok(())
    }

    fn set_scan_type(
        &self,
        session: &SessionRecord,
        series: &str,
        scan_type: &str,
    ) -> Result<(), ArchiveError> {
        self.put(
            &Self::scan_path(session, series),
            &[
                ("xsiType", "xnat:mrScanData"),
                ("xnat:mrScanData/type", scan_type),
                ("xnat:mrScanData/corrected_type", scan_type),
            ],
        )
    }

    fn session_field_strength(
        &self,
        session: &SessionRecord,
    ) -> Result<Option<String>, ArchiveError> {
        let rows = self.get_results(
            "experiments",
            &[
                ("ID", session.session_id.as_str()),
                ("columns", "ID,xnat:mrSessionData/fieldStrength"),
            ],
        )?;
        let row = rows
            .first()
            .ok_or_else(|| ArchiveError::NotFound(format!("session {}", session.session_id)))?;
        Ok(non_empty(column(row, "xnat:mrSessionData/fieldStrength")))
    }

    fn set_session_field_strength(
        &self,
        session: &SessionRecord,
        value: &str,
    ) -> Result<(), ArchiveError> {
        self.put(
            &format!("experiments/{}", session.session_id),
            &[
                ("xsiType", "xnat:mrSessionData"),
                ("xnat:mrSessionData/fieldStrength", value),
            ],
        )
    }

    fn subject_exists(&self, project: &str, subject_label: &str) -> Result<bool, ArchiveError> {
        let url = self.url(&format!("projects/{}/subjects/{}", project, subject_label));
        let response = self
            .authed(self.http.get(&url))
            .query(&[("format", "json")])
            .send()?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        response.error_for_status()?;
        Ok(true)
    }

    fn create_subject(&self, project: &str, subject_label: &str) -> Result<(), ArchiveError> {
        self.put(&format!("projects/{}/subjects/{}", project, subject_label), &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_from_row_normalizes_date_and_time() {
        let row = json!({
            "ID": "PREDICT_E0001",
            "label": "98765",
            "project": "PHD_024",
            "subject_ID": "PREDICT_S0001",
            "subject_label": "0001",
            "date": "2012-01-05",
            "time": "13:45:12",
            "insert_date": ""
        });
        let session = session_from_row(&row);
        assert_eq!(session.date, "20120105");
        assert_eq!(session.time, "134512");
        assert_eq!(session.insert_date, None);
        assert_eq!(session.label, "98765");
    }

    #[test]
    fn test_column_is_case_insensitive_for_qualified_names() {
        let row = json!({"xnat:mrscandata/fieldstrength": "3.0", "ID": 4});
        assert_eq!(column(&row, "xnat:mrScanData/fieldStrength"), "3.0");
        assert_eq!(column(&row, "ID"), "4");
        assert_eq!(column(&row, "missing"), "");
    }
}
