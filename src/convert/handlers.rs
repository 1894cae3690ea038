use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{error, info, warn};

use super::dicom::{is_sidecar, DicomInspector};
use super::naming::{dwi_label, pd_labels, Extension, OutputName};
use super::tools::ToolError;
use super::{Dispatcher, ScanJob};
use crate::classify::Category;
use crate::error::Error;

lazy_static! {
    static ref USABLE_VOLUMES: Regex = Regex::new(r"Number of usable volumes: (\d+)").unwrap();
}

/// Uniform result of a category handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerResult {
    pub outputs: Vec<PathBuf>,
    /// Scan type written back to the archive, if it changed.
    pub corrected_type: Option<String>,
    /// Sub-outputs that could not be produced.
    pub failures: Vec<String>,
}

impl HandlerResult {
    fn record(&mut self, produced: Result<PathBuf, String>) {
        match produced {
            Ok(path) => self.outputs.push(path),
            Err(message) => {
                error!("{}", message);
                self.failures.push(message);
            }
        }
    }
}

/// Outputs a fully converted series of `category` would have. DWI names
/// depend on the converter output and are not known up front.
pub fn expected_outputs(
    category: Category,
    raw_type: &str,
    names: &OutputName<'_>,
    out_dir: &Path,
) -> Vec<PathBuf> {
    match category {
        Category::Pd => {
            let (pd, t2) = pd_labels(raw_type);
            vec![
                names.path(out_dir, &pd, Extension::Nifti),
                names.path(out_dir, &t2, Extension::Nifti),
            ]
        }
        Category::T1 => vec![
            names.path(out_dir, raw_type, Extension::Nifti),
            names.path(out_dir, raw_type, Extension::Mgz),
        ],
        Category::Generic | Category::T2 => vec![names.path(out_dir, raw_type, Extension::Nifti)],
        Category::Dwi | Category::Localizer | Category::NonImage => Vec::new(),
    }
}

/// A converter output that is removed on drop unless [`PartialOutput::keep`]
/// is called. A converter that dies halfway must not leave a file that the
/// next run would take as finished.
pub(crate) struct PartialOutput<'p> {
    path: &'p Path,
    keep: bool,
}

impl<'p> PartialOutput<'p> {
    pub(crate) fn new(path: &'p Path) -> Self {
        Self { path, keep: false }
    }

    pub(crate) fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for PartialOutput<'_> {
    fn drop(&mut self) {
        if self.keep || !self.path.exists() {
            return;
        }
        warn!("Removing incomplete output {}", self.path.display());
        if let Err(e) = fs::remove_file(self.path) {
            error!("Error removing {}: {}", self.path.display(), e);
        }
    }
}

/// Skip the converter when `output` exists; otherwise run it and verify the
/// file appeared.
fn ensure_output<F>(output: &Path, convert: F) -> Result<PathBuf, String>
where
    F: FnOnce(&Path) -> Result<(), ToolError>,
{
    if output.exists() {
        info!("{} already exists, no conversion needed", output.display());
        return Ok(output.to_path_buf());
    }
    let partial = PartialOutput::new(output);
    convert(output).map_err(|e| format!("Error converting to {}: {}", output.display(), e))?;
    if !output.exists() {
        return Err(format!("{} doesn't exist! Conversion failed", output.display()));
    }
    partial.keep();
    Ok(output.to_path_buf())
}

/// Image slices of a downloaded series, sorted by name.
fn slices(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && !is_sidecar(path))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(unix)]
fn link_into(file: &Path, dir: &Path) -> io::Result<()> {
    let name = file.file_name().unwrap_or_default();
    std::os::unix::fs::symlink(file, dir.join(name))
}

#[cfg(not(unix))]
fn link_into(file: &Path, dir: &Path) -> io::Result<()> {
    let name = file.file_name().unwrap_or_default();
    fs::copy(file, dir.join(name)).map(|_| ())
}

/// Split PD/T2 slices by echo number: echo 1 goes to `pd_dir`, the rest to
/// `t2_dir`. Any unreadable slice aborts the split.
pub fn split_by_echo(
    inspector: &dyn DicomInspector,
    dicom_dir: &Path,
    pd_dir: &Path,
    t2_dir: &Path,
) -> Result<(usize, usize), Error> {
    let (mut pd, mut t2) = (0, 0);
    for slice in slices(dicom_dir)? {
        let echo = inspector.echo_number(&slice).map_err(|e| {
            warn!("Exception caught reading DICOM files in {}", dicom_dir.display());
            e
        })?;
        match echo {
            None => warn!("{} does not appear to be a valid dicom file!", slice.display()),
            Some(1) => {
                link_into(&slice, pd_dir)?;
                pd += 1;
            }
            Some(_) => {
                link_into(&slice, t2_dir)?;
                t2 += 1;
            }
        }
    }
    Ok((pd, t2))
}

pub fn parse_usable_volumes(output: &str) -> Option<u32> {
    USABLE_VOLUMES
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

impl Dispatcher<'_> {
    pub(crate) fn convert_pd(&self, job: &ScanJob<'_>) -> Result<HandlerResult, Error> {
        let (pd_label, t2_label) = pd_labels(&job.scan.scan_type);
        let pd_dir = self.scratch("pd-")?;
        let t2_dir = self.scratch("t2-")?;
        let (pd_count, t2_count) =
            split_by_echo(self.inspector, job.dicom_dir, pd_dir.path(), t2_dir.path())?;

        let mut result = HandlerResult::default();
        for (label, dir, count) in [
            (pd_label, pd_dir.path(), pd_count),
            (t2_label, t2_dir.path(), t2_count),
        ] {
            let output = job.names.path(job.out_dir, &label, Extension::Nifti);
            if count == 0 && !output.exists() {
                result.record(Err(format!(
                    "No {} slices in {},{}",
                    label, job.session.label, job.scan.series
                )));
                continue;
            }
            result.record(ensure_output(&output, |out| self.tools.to_nifti(dir, out)));
        }
        Ok(result)
    }

    pub(crate) fn convert_dwi(&self, job: &ScanJob<'_>) -> Result<HandlerResult, Error> {
        let initial = job
            .names
            .path(job.out_dir, &job.scan.scan_type, Extension::Nrrd);
        // An unlabeled NRRD would look converted on the next run.
        let partial = PartialOutput::new(&initial);
        let output = self.tools.to_nrrd(job.dicom_dir, &initial)?;
        if !initial.exists() {
            return Err(Error::Other(format!(
                "{} doesn't exist! Conversion failed",
                initial.display()
            )));
        }
        let Some(volumes) = parse_usable_volumes(&output) else {
            return Err(Error::Other(format!(
                "Couldn't find number of volumes converting {},{}",
                job.session.label, job.scan.series
            )));
        };

        let label = dwi_label(volumes);
        let corrected = job.names.path(job.out_dir, &label, Extension::Nrrd);
        if corrected != initial {
            fs::rename(&initial, &corrected)?;
        }
        partial.keep();

        let mut result = HandlerResult::default();
        result.outputs.push(corrected);
        match self.write_back_type(job.session, job.scan, &label) {
            Ok(corrected_type) => result.corrected_type = corrected_type,
            Err(message) => result.failures.push(message),
        }
        Ok(result)
    }

    pub(crate) fn convert_t1(&self, job: &ScanJob<'_>) -> Result<HandlerResult, Error> {
        let raw_type = job.scan.scan_type.as_str();
        let nifti = job.names.path(job.out_dir, raw_type, Extension::Nifti);
        let mgz = job.names.path(job.out_dir, raw_type, Extension::Mgz);

        let mut result = HandlerResult::default();
        result.record(ensure_output(&nifti, |out| {
            self.tools.to_nifti(job.dicom_dir, out)
        }));

        if mgz.exists() {
            info!("{} already exists, no conversion needed", mgz.display());
            result.outputs.push(mgz);
            return Ok(result);
        }
        let partial = PartialOutput::new(&mgz);
        match self.tools.to_mgz(job.dicom_dir, &mgz) {
            Ok(()) => partial.keep(),
            Err(e) => {
                drop(partial);
                warn!(
                    "Problem converting dicom {},{} to {}: {}. Trying to convert the .nii.gz file to .mgz",
                    job.session.label,
                    job.scan.series,
                    mgz.display(),
                    e
                );
            }
        }
        if !mgz.exists() && nifti.exists() {
            if let Err(e) = self.mgz_from_nifti(&nifti, &mgz, job.dicom_dir) {
                warn!("Fallback conversion to {} failed: {}", mgz.display(), e);
            }
            if !nifti.exists() {
                result.outputs.retain(|path| path != &nifti);
                result.record(Err(format!(
                    "{} was lost while converting to {}",
                    nifti.display(),
                    mgz.display()
                )));
            }
        }
        let produced = if mgz.exists() {
            Ok(mgz)
        } else {
            Err(format!("{} doesn't exist! Conversion failed", mgz.display()))
        };
        result.record(produced);
        Ok(result)
    }

    pub(crate) fn convert_generic(&self, job: &ScanJob<'_>) -> Result<HandlerResult, Error> {
        let output = job
            .names
            .path(job.out_dir, &job.scan.scan_type, Extension::Nifti);
        let mut result = HandlerResult::default();
        result.record(ensure_output(&output, |out| {
            self.tools.to_nifti(job.dicom_dir, out)
        }));
        Ok(result)
    }

    /// Convert an existing `.nii.gz` to MGZ using acquisition parameters read
    /// from one slice of the series. The NIfTI is recompressed even when the
    /// conversion fails; if recompression fails the uncompressed copy is
    /// removed so the next run converts the series again.
    fn mgz_from_nifti(&self, nifti_gz: &Path, mgz: &Path, dicom_dir: &Path) -> Result<(), Error> {
        let representative = slices(dicom_dir)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Other(format!("No DICOM files in {}", dicom_dir.display())))?;
        let params = self.inspector.acquisition_params(&representative)?;

        let nifti = self.tools.decompress(nifti_gz)?;
        let uncompressed = PartialOutput::new(&nifti);
        let partial = PartialOutput::new(mgz);
        let converted = self.tools.nifti_to_mgz(&nifti, mgz, &params);
        if converted.is_ok() && mgz.exists() {
            partial.keep();
        } else {
            drop(partial);
        }
        let recompressed = self.tools.compress(&nifti);
        if recompressed.is_ok() {
            uncompressed.keep();
        } else {
            drop(uncompressed);
        }
        converted?;
        recompressed?;
        Ok(())
    }
}
