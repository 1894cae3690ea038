//! Deterministic destination names and the usability prefix.
//!
//! A converted file lives at
//! `<base>/<project>/<subject>/<session>/ANONRAW/[unusable_]<subject>_<session>_<label>_<series>.<ext>`
//! and its presence is what marks the series as done.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::info;

use crate::model::SessionRecord;

pub const UNUSABLE_PREFIX: &str = "unusable_";
pub const ANONRAW: &str = "ANONRAW";

lazy_static! {
    static ref DWI_LABEL: Regex = Regex::new(r"DWI-(\d+)").unwrap();
    static ref PD_SUFFIX: Regex = Regex::new(r"-\d\d").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    Nifti,
    /// Uncompressed NIfTI, only present while the MGZ fallback runs.
    Nii,
    Nrrd,
    Mgz,
}

impl Extension {
    /// `Nifti` precedes `Nii` so `.nii.gz` is never read as `.nii`.
    pub const ALL: [Extension; 4] = [
        Extension::Nifti,
        Extension::Nii,
        Extension::Nrrd,
        Extension::Mgz,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Extension::Nifti => "nii.gz",
            Extension::Nii => "nii",
            Extension::Nrrd => "nrrd",
            Extension::Mgz => "mgz",
        }
    }
}

/// Archive-reported quality judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usability {
    Usable,
    Unusable,
}

impl Usability {
    /// `usable`/`VIExcellent` and numeric scores of 5 or more are usable.
    /// Everything else, including labels we do not recognize, is not.
    pub fn from_quality(quality: &str) -> Usability {
        let quality = quality.trim();
        match quality {
            "usable" | "VIExcellent" => Usability::Usable,
            "VIUnusable" | "VIQuestionable" | "unusable" | "questionable" => Usability::Unusable,
            other => match other.parse::<f64>() {
                Ok(score) if score >= 5.0 => Usability::Usable,
                Ok(_) => Usability::Unusable,
                Err(_) => {
                    tracing::warn!("Unrecognized quality label '{}', treating as unusable", other);
                    Usability::Unusable
                }
            },
        }
    }

    pub fn is_usable(self) -> bool {
        self == Usability::Usable
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Usability::Usable => "",
            Usability::Unusable => UNUSABLE_PREFIX,
        }
    }
}

/// `<base>/<project>/<subject>/<session>/ANONRAW`
pub fn session_output_dir(base: &Path, session: &SessionRecord) -> PathBuf {
    base.join(&session.project)
        .join(&session.subject_label)
        .join(&session.label)
        .join(ANONRAW)
}

/// Name builder for one output of one series.
#[derive(Debug, Clone)]
pub struct OutputName<'a> {
    pub subject_label: &'a str,
    pub session_label: &'a str,
    pub series: &'a str,
    pub usability: Usability,
}

impl<'a> OutputName<'a> {
    pub fn new(session: &'a SessionRecord, series: &'a str, usability: Usability) -> Self {
        Self {
            subject_label: &session.subject_label,
            session_label: &session.label,
            series,
            usability,
        }
    }

    pub fn file_name(&self, label: &str, ext: Extension) -> String {
        format!(
            "{}{}_{}_{}_{}.{}",
            self.usability.prefix(),
            self.subject_label,
            self.session_label,
            label,
            self.series,
            ext.as_str()
        )
    }

    pub fn path(&self, dir: &Path, label: &str, ext: Extension) -> PathBuf {
        dir.join(self.file_name(label, ext))
    }
}

/// Labels for the two halves of a split PD series: `PD-15`/`T2-15` for a raw
/// type containing `-15`, plain `PD`/`T2` otherwise.
pub fn pd_labels(raw_type: &str) -> (String, String) {
    let suffix = PD_SUFFIX
        .find(raw_type)
        .map(|m| m.as_str())
        .unwrap_or_default();
    (format!("PD{}", suffix), format!("T2{}", suffix))
}

pub fn dwi_label(volumes: u32) -> String {
    format!("DWI-{}", volumes)
}

/// Usable volume count embedded in a `DWI-<N>` label or file name.
pub fn dwi_volumes(name: &str) -> Option<u32> {
    DWI_LABEL
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// A destination file name split back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOutput {
    pub unusable: bool,
    /// `<subject>_<session>_<label>`
    pub stem: String,
    pub series: String,
    pub ext: Extension,
}

pub fn parse_output_name(file_name: &str) -> Option<ParsedOutput> {
    let (unusable, rest) = match file_name.strip_prefix(UNUSABLE_PREFIX) {
        Some(rest) => (true, rest),
        None => (false, file_name),
    };
    let (ext, base) = Extension::ALL.iter().find_map(|ext| {
        rest.strip_suffix(ext.as_str())
            .and_then(|b| b.strip_suffix('.'))
            .map(|b| (*ext, b))
    })?;
    let (stem, series) = base.rsplit_once('_')?;
    if stem.is_empty() || series.is_empty() {
        return None;
    }
    Some(ParsedOutput {
        unusable,
        stem: stem.to_string(),
        series: series.to_string(),
        ext,
    })
}

/// Existing outputs in `dir` belonging to `series`, optionally restricted to
/// one extension.
pub fn existing_outputs(
    dir: &Path,
    series: &str,
    ext: Option<Extension>,
) -> io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(parsed) = parse_output_name(name) {
            if parsed.series == series && ext.map_or(true, |e| e == parsed.ext) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Bring the prefix of every existing output of `series` in line with the
/// current usability judgment. Returns the number of files renamed.
///
/// Renames never produce a second copy: if the target name is already taken
/// the stale file is removed instead.
pub fn reconcile_usability(dir: &Path, series: &str, usability: Usability) -> io::Result<usize> {
    let mut renamed = 0;
    for path in existing_outputs(dir, series, None)? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let target = match (usability, name.strip_prefix(UNUSABLE_PREFIX)) {
            (Usability::Unusable, None) => format!("{}{}", UNUSABLE_PREFIX, name),
            (Usability::Usable, Some(stripped)) => stripped.to_string(),
            _ => continue,
        };
        let target = dir.join(target);
        if target.exists() {
            info!(
                "{} already exists, removing stale {}",
                target.display(),
                path.display()
            );
            fs::remove_file(&path)?;
        } else {
            info!("Renaming {} to {}", path.display(), target.display());
            fs::rename(&path, &target)?;
        }
        renamed += 1;
    }
    Ok(renamed)
}
