#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use xnat_sync::archive::{Archive, ArchiveError, SessionFilter};
use xnat_sync::convert::dicom::{AcquisitionParams, DicomError, DicomInspector};
use xnat_sync::convert::tools::{ConversionTools, ToolError};
use xnat_sync::model::{ScanRecord, SessionRecord, StudyIdentity};
use xnat_sync::transfer::identifier::{IdentifierRequest, IdentifierService};
use xnat_sync::transfer::{RemapTool, TransferSettings};
use xnat_sync::Error;

pub fn session(project: &str, subject: &str, label: &str, id: &str) -> SessionRecord {
    SessionRecord {
        project: project.to_string(),
        subject_id: format!("S_{}", subject),
        subject_label: subject.to_string(),
        session_id: id.to_string(),
        label: label.to_string(),
        date: "2012-01-05".to_string(),
        time: "13:45:12".to_string(),
        insert_date: Some("2012-01-06 09:00:00.0".to_string()),
    }
}

pub fn scan(series: &str, scan_type: &str, quality: &str) -> ScanRecord {
    ScanRecord {
        series: series.to_string(),
        scan_type: scan_type.to_string(),
        quality: quality.to_string(),
        field_strength: None,
    }
}

/// Slice content understood by [`FakeInspector`].
pub fn slice(echo: i32) -> Vec<u8> {
    format!("uid=1.2.3;date=20120105;time=134512.250;echo={}", echo).into_bytes()
}

pub fn identity_slice(uid: &str, date: &str, time: &str) -> Vec<u8> {
    format!("uid={};date={};time={};echo=1", uid, date, time).into_bytes()
}

/// In-memory archive. Scan type and field strength updates are applied to
/// the stored records so a second pass sees them.
#[derive(Default)]
pub struct FakeArchive {
    sessions: RefCell<Vec<SessionRecord>>,
    scans: RefCell<HashMap<String, Vec<ScanRecord>>>,
    files: RefCell<HashMap<(String, String), Vec<(String, Vec<u8>)>>>,
    field_strengths: RefCell<HashMap<String, String>>,
    subjects: RefCell<HashSet<(String, String)>>,
    pub type_updates: RefCell<Vec<(String, String)>>,
    pub created_subjects: RefCell<Vec<(String, String)>>,
    pub downloads: Cell<usize>,
}

impl FakeArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, session: SessionRecord) {
        self.subjects
            .borrow_mut()
            .insert((session.project.clone(), session.subject_label.clone()));
        self.sessions.borrow_mut().push(session);
    }

    pub fn add_scan(&self, session: &SessionRecord, scan: ScanRecord, files: Vec<(&str, Vec<u8>)>) {
        self.files.borrow_mut().insert(
            (session.session_id.clone(), scan.series.clone()),
            files
                .into_iter()
                .map(|(name, content)| (name.to_string(), content))
                .collect(),
        );
        self.scans
            .borrow_mut()
            .entry(session.session_id.clone())
            .or_default()
            .push(scan);
    }

    pub fn add_subject(&self, project: &str, subject_label: &str) {
        self.subjects
            .borrow_mut()
            .insert((project.to_string(), subject_label.to_string()));
    }

    pub fn set_field_strength(&self, session: &SessionRecord, value: &str) {
        self.field_strengths
            .borrow_mut()
            .insert(session.session_id.clone(), value.to_string());
    }

    pub fn field_strength(&self, session: &SessionRecord) -> Option<String> {
        self.field_strengths.borrow().get(&session.session_id).cloned()
    }

    pub fn stored_scans(&self, session: &SessionRecord) -> Vec<ScanRecord> {
        self.scans
            .borrow()
            .get(&session.session_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Archive for FakeArchive {
    fn find_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>, ArchiveError> {
        Ok(self
            .sessions
            .borrow()
            .iter()
            .filter(|s| filter.accepts(s))
            .cloned()
            .collect())
    }

    fn scans(&self, session: &SessionRecord) -> Result<Vec<ScanRecord>, ArchiveError> {
        Ok(self.stored_scans(session))
    }

    fn scan_files(&self, session: &SessionRecord, series: &str) -> Result<Vec<String>, ArchiveError> {
        Ok(self
            .files
            .borrow()
            .get(&(session.session_id.clone(), series.to_string()))
            .map(|files| files.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default())
    }

    fn download_file(
        &self,
        session: &SessionRecord,
        series: &str,
        file_name: &str,
        dest: &Path,
    ) -> Result<(), ArchiveError> {
        let files = self.files.borrow();
        let content = files
            .get(&(session.session_id.clone(), series.to_string()))
            .and_then(|files| files.iter().find(|(name, _)| name == file_name))
            .map(|(_, content)| content.clone())
            .ok_or_else(|| ArchiveError::NotFound(file_name.to_string()))?;
        fs::write(dest, content)?;
        self.downloads.set(self.downloads.get() + 1);
        Ok(())
    }

    fn set_scan_type(
        &self,
        session: &SessionRecord,
        series: &str,
        scan_type: &str,
    ) -> Result<(), ArchiveError> {
        if let Some(scans) = self.scans.borrow_mut().get_mut(&session.session_id) {
            for scan in scans.iter_mut().filter(|s| s.series == series) {
                scan.scan_type = scan_type.to_string();
            }
        }
        self.type_updates
            .borrow_mut()
            .push((series.to_string(), scan_type.to_string()));
        Ok(())
    }

    fn session_field_strength(&self, session: &SessionRecord) -> Result<Option<String>, ArchiveError> {
        Ok(self.field_strength(session))
    }

    fn set_session_field_strength(
        &self,
        session: &SessionRecord,
        value: &str,
    ) -> Result<(), ArchiveError> {
        self.set_field_strength(session, value);
        Ok(())
    }

    fn subject_exists(&self, project: &str, subject_label: &str) -> Result<bool, ArchiveError> {
        Ok(self
            .subjects
            .borrow()
            .contains(&(project.to_string(), subject_label.to_string())))
    }

    fn create_subject(&self, project: &str, subject_label: &str) -> Result<(), ArchiveError> {
        self.add_subject(project, subject_label);
        self.created_subjects
            .borrow_mut()
            .push((project.to_string(), subject_label.to_string()));
        Ok(())
    }
}

/// Reads `key=value;...` text files in place of DICOM. A file containing
/// `corrupt` cannot be read; a file without `uid` is not an image slice.
pub struct FakeInspector;

fn fields(path: &Path) -> Result<HashMap<String, String>, DicomError> {
    let text = fs::read_to_string(path).map_err(|e| DicomError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    if text.contains("corrupt") {
        return Err(DicomError::Read {
            path: path.to_path_buf(),
            message: "not a DICOM file".to_string(),
        });
    }
    Ok(text
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect())
}

fn field(path: &Path, fields: &HashMap<String, String>, tag: &'static str) -> Result<String, DicomError> {
    fields.get(tag).cloned().ok_or(DicomError::MissingTag {
        path: path.to_path_buf(),
        tag,
    })
}

impl DicomInspector for FakeInspector {
    fn echo_number(&self, path: &Path) -> Result<Option<i32>, DicomError> {
        let fields = fields(path)?;
        if !fields.contains_key("uid") {
            return Ok(None);
        }
        let echo = field(path, &fields, "echo")?;
        echo.parse().map(Some).map_err(|_| DicomError::Value {
            path: path.to_path_buf(),
            tag: "echo",
            message: echo,
        })
    }

    fn acquisition_params(&self, path: &Path) -> Result<AcquisitionParams, DicomError> {
        fields(path)?;
        Ok(AcquisitionParams {
            echo_time: 2.91,
            repetition_time: 2300.0,
            flip_angle: 9.0,
            inversion_time: Some(900.0),
        })
    }

    fn study_identity(&self, path: &Path) -> Result<StudyIdentity, DicomError> {
        let fields = fields(path)?;
        Ok(StudyIdentity::new(
            &field(path, &fields, "uid")?,
            &field(path, &fields, "date")?,
            &field(path, &fields, "time")?,
        ))
    }
}

/// Converters that write a small file naming how many slices they were
/// given. Every call is recorded as `<operation> <output file name>`.
///
/// `crash_after_write` makes the NIfTI and NRRD converters write their output
/// and then fail, like a converter killed halfway through.
pub struct FakeTools {
    pub calls: RefCell<Vec<String>>,
    pub nrrd_output: RefCell<String>,
    pub fail_mgz: Cell<bool>,
    pub fail_nifti: Cell<bool>,
    pub fail_compress: Cell<bool>,
    pub crash_after_write: Cell<bool>,
}

impl Default for FakeTools {
    fn default() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            nrrd_output: RefCell::new("Number of usable volumes: 32\n".to_string()),
            fail_mgz: Cell::new(false),
            fail_nifti: Cell::new(false),
            fail_compress: Cell::new(false),
            crash_after_write: Cell::new(false),
        }
    }
}

fn crashed(program: &str) -> ToolError {
    ToolError::Failed {
        program: program.to_string(),
        status: "exit status: 139".to_string(),
        output: String::new(),
    }
}

fn failed(program: &str) -> ToolError {
    ToolError::Failed {
        program: program.to_string(),
        status: "exit status: 1".to_string(),
        output: String::new(),
    }
}

fn name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl FakeTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }

    fn record(&self, operation: &str, path: &Path) {
        self.calls
            .borrow_mut()
            .push(format!("{} {}", operation, name(path)));
    }

    fn write_slice_count(dicom_dir: &Path, output: &Path) -> Result<(), ToolError> {
        let count = fs::read_dir(dicom_dir)?.count();
        fs::write(output, count.to_string())?;
        Ok(())
    }
}

impl ConversionTools for FakeTools {
    fn to_nifti(&self, dicom_dir: &Path, output: &Path) -> Result<(), ToolError> {
        self.record("to_nifti", output);
        if self.fail_nifti.get() {
            return Err(failed("ConvertBetweenFileFormats"));
        }
        Self::write_slice_count(dicom_dir, output)?;
        if self.crash_after_write.get() {
            return Err(crashed("ConvertBetweenFileFormats"));
        }
        Ok(())
    }

    fn to_nrrd(&self, dicom_dir: &Path, output: &Path) -> Result<String, ToolError> {
        self.record("to_nrrd", output);
        Self::write_slice_count(dicom_dir, output)?;
        if self.crash_after_write.get() {
            return Err(crashed("DicomToNrrdConverter"));
        }
        Ok(self.nrrd_output.borrow().clone())
    }

    fn to_mgz(&self, dicom_dir: &Path, output: &Path) -> Result<(), ToolError> {
        self.record("to_mgz", output);
        if self.fail_mgz.get() {
            return Err(failed("mri_convert"));
        }
        Self::write_slice_count(dicom_dir, output)
    }

    fn nifti_to_mgz(
        &self,
        nifti: &Path,
        output: &Path,
        params: &AcquisitionParams,
    ) -> Result<(), ToolError> {
        self.record("nifti_to_mgz", output);
        fs::write(output, format!("{} te={}", name(nifti), params.echo_time))?;
        Ok(())
    }

    fn decompress(&self, path: &Path) -> Result<PathBuf, ToolError> {
        self.record("decompress", path);
        let plain = xnat_sync::convert::tools::strip_gz(path);
        fs::rename(path, &plain)?;
        Ok(plain)
    }

    fn compress(&self, path: &Path) -> Result<(), ToolError> {
        self.record("compress", path);
        if self.fail_compress.get() {
            return Err(failed("gzip"));
        }
        let mut gz = path.as_os_str().to_owned();
        gz.push(".gz");
        fs::rename(path, PathBuf::from(gz))?;
        Ok(())
    }
}

pub struct FakeIdentifiers {
    pub requests: RefCell<Vec<String>>,
}

impl FakeIdentifiers {
    pub fn new() -> Self {
        Self {
            requests: RefCell::new(Vec::new()),
        }
    }
}

impl IdentifierService for FakeIdentifiers {
    fn issue(&self, request: &IdentifierRequest<'_>) -> Result<String, Error> {
        self.requests.borrow_mut().push(format!(
            "{} {} {} {} {}",
            request.site, request.subject_label, request.date, request.time, request.study_uid
        ));
        Ok(format!("NEW-{}", request.subject_label))
    }
}

/// Captures what would have been transmitted; the scratch directories are
/// gone once the transfer returns.
pub struct Transmission {
    pub script_name: String,
    pub script: String,
    pub destination: String,
    pub files_per_dir: Vec<usize>,
}

pub struct FakeRemap {
    pub output: RefCell<String>,
    pub transmissions: RefCell<Vec<Transmission>>,
}

impl FakeRemap {
    pub fn new() -> Self {
        Self {
            output: RefCell::new("Sent 3 objects\n".to_string()),
            transmissions: RefCell::new(Vec::new()),
        }
    }
}

impl RemapTool for FakeRemap {
    fn transmit(&self, script: &Path, destination: &str, dirs: &[PathBuf]) -> Result<String, ToolError> {
        let mut files_per_dir = Vec::new();
        for dir in dirs {
            files_per_dir.push(fs::read_dir(dir)?.count());
        }
        self.transmissions.borrow_mut().push(Transmission {
            script_name: name(script),
            script: fs::read_to_string(script)?,
            destination: destination.to_string(),
            files_per_dir,
        });
        Ok(self.output.borrow().clone())
    }
}

/// Transfer settings with a base anonymization template written into `dir`.
pub fn transfer_settings(dir: &Path) -> TransferSettings {
    let base_anon = dir.join("base.das");
    fs::write(&base_anon, "(0008,0080) := \"\"\n").unwrap();
    TransferSettings {
        remap_command: PathBuf::from("DicomRemap"),
        base_anon,
        dicom_scp: "dicom://predict.example.org:8104/XNAT".to_string(),
    }
}
