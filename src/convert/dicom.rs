use std::path::{Path, PathBuf};

use ::dicom::core::Tag;
use ::dicom::dictionary_std::tags;
use ::dicom::object::{open_file, DefaultDicomObject};
use thiserror::Error;

use crate::model::StudyIdentity;

#[derive(Error, Debug)]
pub enum DicomError {
    #[error("Error reading {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("{path} has no {tag} element")]
    MissingTag { path: PathBuf, tag: &'static str },

    #[error("{path}: bad {tag} value: {message}")]
    Value {
        path: PathBuf,
        tag: &'static str,
        message: String,
    },
}

/// Acquisition parameters passed to the NIfTI-to-MGZ fallback conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionParams {
    pub echo_time: f64,
    pub repetition_time: f64,
    pub flip_angle: f64,
    pub inversion_time: Option<f64>,
}

/// Per-file DICOM metadata lookups.
pub trait DicomInspector {
    /// Echo number of one slice. `Ok(None)` means the file carries no study
    /// instance UID and is not a usable image slice.
    fn echo_number(&self, path: &Path) -> Result<Option<i32>, DicomError>;

    fn acquisition_params(&self, path: &Path) -> Result<AcquisitionParams, DicomError>;

    fn study_identity(&self, path: &Path) -> Result<StudyIdentity, DicomError>;
}

/// [`DicomInspector`] reading Part 10 files from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct DicomFiles;

fn open(path: &Path) -> Result<DefaultDicomObject, DicomError> {
    open_file(path).map_err(|e| DicomError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn has(obj: &DefaultDicomObject, tag: Tag) -> bool {
    matches!(obj.element_opt(tag), Ok(Some(_)))
}

fn string(
    obj: &DefaultDicomObject,
    path: &Path,
    tag: Tag,
    name: &'static str,
) -> Result<String, DicomError> {
    let element = obj.element(tag).map_err(|_| DicomError::MissingTag {
        path: path.to_path_buf(),
        tag: name,
    })?;
    element
        .to_str()
        .map(|s| s.trim().trim_end_matches('\0').to_string())
        .map_err(|e| DicomError::Value {
            path: path.to_path_buf(),
            tag: name,
            message: e.to_string(),
        })
}

fn float(
    obj: &DefaultDicomObject,
    path: &Path,
    tag: Tag,
    name: &'static str,
) -> Result<f64, DicomError> {
    let element = obj.element(tag).map_err(|_| DicomError::MissingTag {
        path: path.to_path_buf(),
        tag: name,
    })?;
    element.to_float64().map_err(|e| DicomError::Value {
        path: path.to_path_buf(),
        tag: name,
        message: e.to_string(),
    })
}

impl DicomInspector for DicomFiles {
    fn echo_number(&self, path: &Path) -> Result<Option<i32>, DicomError> {
        let obj = open(path)?;
        if !has(&obj, tags::STUDY_INSTANCE_UID) {
            return Ok(None);
        }
        let element = obj
            .element(tags::ECHO_NUMBERS)
            .map_err(|_| DicomError::MissingTag {
                path: path.to_path_buf(),
                tag: "EchoNumbers",
            })?;
        let echo = element.to_int::<i32>().map_err(|e| DicomError::Value {
            path: path.to_path_buf(),
            tag: "EchoNumbers",
            message: e.to_string(),
        })?;
        Ok(Some(echo))
    }

    fn acquisition_params(&self, path: &Path) -> Result<AcquisitionParams, DicomError> {
        let obj = open(path)?;
        let inversion_time = if has(&obj, tags::INVERSION_TIME) {
            Some(float(&obj, path, tags::INVERSION_TIME, "InversionTime")?)
        } else {
            None
        };
        Ok(AcquisitionParams {
            echo_time: float(&obj, path, tags::ECHO_TIME, "EchoTime")?,
            repetition_time: float(&obj, path, tags::REPETITION_TIME, "RepetitionTime")?,
            flip_angle: float(&obj, path, tags::FLIP_ANGLE, "FlipAngle")?,
            inversion_time,
        })
    }

    fn study_identity(&self, path: &Path) -> Result<StudyIdentity, DicomError> {
        let obj = open(path)?;
        let uid = string(&obj, path, tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?;
        let date = string(&obj, path, tags::STUDY_DATE, "StudyDate")?;
        let time = string(&obj, path, tags::STUDY_TIME, "StudyTime")?;
        Ok(StudyIdentity::new(&uid, &date, &time))
    }
}

/// Extensions of the files XNAT stores next to the slices of a series
/// (resource catalogs, text dumps, snapshots).
const SIDECAR_EXTENSIONS: [&str; 5] = ["xml", "txt", "gif", "jpg", "png"];

/// Archive sidecar files downloaded alongside slices. Decided by extension
/// only; slice names are free-form.
pub fn is_sidecar(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map_or(false, |ext| SIDECAR_EXTENSIONS.contains(&ext.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_sidecar() {
        assert!(is_sidecar(Path::new("/tmp/x/catalog.xml")));
        assert!(is_sidecar(Path::new("/tmp/x/scan_info.txt")));
        assert!(is_sidecar(Path::new("/tmp/x/SNAPSHOT.GIF")));
        assert!(!is_sidecar(Path::new("/tmp/x/1.3.12.2.dcm")));
        assert!(!is_sidecar(Path::new("/tmp/x/series_info_0001.dcm")));
        assert!(!is_sidecar(Path::new("/tmp/x/MR.1.2.3.4")));
    }

    #[test]
    fn test_unreadable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.dcm");
        std::fs::write(&path, b"not a dicom file").unwrap();
        let err = DicomFiles.echo_number(&path).unwrap_err();
        assert!(matches!(err, DicomError::Read { .. }));
    }
}
