use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::dicom::AcquisitionParams;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {output}")]
    Failed {
        program: String,
        status: String,
        output: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Run an external program to completion and return its combined
/// stdout/stderr. A non-zero exit status is an error.
pub fn run_tool(command: &mut Command) -> Result<String, ToolError> {
    let program = command.get_program().to_string_lossy().into_owned();
    debug!("Running {:?}", command);
    let output = command.output().map_err(|source| ToolError::Spawn {
        program: program.clone(),
        source,
    })?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        return Err(ToolError::Failed {
            program,
            status: output.status.to_string(),
            output: text,
        });
    }
    Ok(text)
}

/// External converters used by the dispatcher. Implementations must leave the
/// output file at the given path on success.
pub trait ConversionTools {
    /// DICOM directory to compressed NIfTI.
    fn to_nifti(&self, dicom_dir: &Path, output: &Path) -> Result<(), ToolError>;

    /// DICOM directory to NRRD; returns the converter's text output, which
    /// carries the usable volume count.
    fn to_nrrd(&self, dicom_dir: &Path, output: &Path) -> Result<String, ToolError>;

    /// DICOM directory to MGZ.
    fn to_mgz(&self, dicom_dir: &Path, output: &Path) -> Result<(), ToolError>;

    /// Uncompressed NIfTI to MGZ with explicit acquisition parameters.
    fn nifti_to_mgz(
        &self,
        nifti: &Path,
        output: &Path,
        params: &AcquisitionParams,
    ) -> Result<(), ToolError>;

    /// Decompress `x.nii.gz` in place, returning the path of `x.nii`.
    fn decompress(&self, path: &Path) -> Result<PathBuf, ToolError>;

    /// Compress a file in place (`x.nii` becomes `x.nii.gz`).
    fn compress(&self, path: &Path) -> Result<(), ToolError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPaths {
    pub dicom_to_nrrd: PathBuf,
    pub mri_convert: PathBuf,
    pub convert_between_file_formats: PathBuf,
    #[serde(default = "default_gzip")]
    pub gzip: PathBuf,
    #[serde(default = "default_gunzip")]
    pub gunzip: PathBuf,
    #[serde(default = "default_freesurfer_home")]
    pub freesurfer_home: PathBuf,
}

fn default_gzip() -> PathBuf {
    PathBuf::from("gzip")
}

fn default_gunzip() -> PathBuf {
    PathBuf::from("gunzip")
}

fn default_freesurfer_home() -> PathBuf {
    PathBuf::from("/opt/freesurfer")
}

/// [`ConversionTools`] backed by the configured command-line programs.
pub struct ExternalTools {
    paths: ToolPaths,
}

impl ExternalTools {
    pub fn new(paths: ToolPaths) -> Self {
        Self { paths }
    }

    fn freesurfer(&self, program: &Path) -> Command {
        let mut command = Command::new(program);
        command.env("FREESURFER_HOME", &self.paths.freesurfer_home);
        command
    }
}

impl ConversionTools for ExternalTools {
    fn to_nifti(&self, dicom_dir: &Path, output: &Path) -> Result<(), ToolError> {
        info!("Converting {} to {}", dicom_dir.display(), output.display());
        let text = run_tool(
            Command::new(&self.paths.convert_between_file_formats)
                .arg(dicom_dir)
                .arg(output),
        )?;
        debug!("{}", text);
        Ok(())
    }

    fn to_nrrd(&self, dicom_dir: &Path, output: &Path) -> Result<String, ToolError> {
        info!("Converting {} to {}", dicom_dir.display(), output.display());
        let text = run_tool(
            self.freesurfer(&self.paths.dicom_to_nrrd)
                .arg("--inputDicomDirectory")
                .arg(dicom_dir)
                .arg("--outputVolume")
                .arg(output)
                // Only affects Siemens data.
                .arg("--useBMatrixGradientDirections"),
        )?;
        info!("{}", text);
        Ok(text)
    }

    fn to_mgz(&self, dicom_dir: &Path, output: &Path) -> Result<(), ToolError> {
        info!("Converting {} to {}", dicom_dir.display(), output.display());
        let text = run_tool(
            self.freesurfer(&self.paths.mri_convert)
                .args(["-it", "dicom"])
                .arg(dicom_dir)
                .arg(output),
        )?;
        debug!("{}", text);
        Ok(())
    }

    fn nifti_to_mgz(
        &self,
        nifti: &Path,
        output: &Path,
        params: &AcquisitionParams,
    ) -> Result<(), ToolError> {
        info!("Converting {} to {}", nifti.display(), output.display());
        let mut command = self.freesurfer(&self.paths.mri_convert);
        command
            .arg("-te")
            .arg(params.echo_time.to_string())
            .arg("-tr")
            .arg(params.repetition_time.to_string());
        if let Some(inversion_time) = params.inversion_time {
            command.arg("-TI").arg(inversion_time.to_string());
        }
        command
            .arg("-flip_angle")
            .arg(params.flip_angle.to_string())
            .args(["-it", "nii"])
            .arg(nifti)
            .arg(output);
        let text = run_tool(&mut command)?;
        debug!("{}", text);
        Ok(())
    }

    fn decompress(&self, path: &Path) -> Result<PathBuf, ToolError> {
        run_tool(Command::new(&self.paths.gunzip).arg("-f").arg(path))?;
        Ok(strip_gz(path))
    }

    fn compress(&self, path: &Path) -> Result<(), ToolError> {
        run_tool(Command::new(&self.paths.gzip).arg(path))?;
        Ok(())
    }
}

/// `x.nii.gz` -> `x.nii`; other paths are returned unchanged.
pub fn strip_gz(path: &Path) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_suffix(".gz")) {
        Some(stripped) => PathBuf::from(stripped),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_gz() {
        assert_eq!(
            strip_gz(Path::new("/a/b_T1-15_3.nii.gz")),
            PathBuf::from("/a/b_T1-15_3.nii")
        );
        assert_eq!(strip_gz(Path::new("/a/b.mgz")), PathBuf::from("/a/b.mgz"));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_tool_captures_output_and_status() {
        let output = run_tool(Command::new("sh").args(["-c", "echo out; echo err 1>&2"])).unwrap();
        assert!(output.contains("out"));
        assert!(output.contains("err"));

        let err = run_tool(Command::new("sh").args(["-c", "echo boom; exit 3"])).unwrap_err();
        match err {
            ToolError::Failed { output, .. } => assert!(output.contains("boom")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_run_tool_missing_program() {
        let err = run_tool(&mut Command::new("/definitely/not/a/tool")).unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
