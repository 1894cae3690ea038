use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Field values rewritten into every transferred DICOM file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnonymizationFields<'a> {
    pub site: &'a str,
    pub project: &'a str,
    pub subject_label: &'a str,
    pub session_id: &'a str,
}

impl AnonymizationFields<'_> {
    pub fn script_name(&self) -> String {
        format!(
            "anon-{}_{}_{}.das",
            self.project, self.subject_label, self.session_id
        )
    }

    /// Directives appended to the base template.
    pub fn directives(&self) -> String {
        let mut out = String::new();
        out.push('\n');
        out.push_str(&format!("(0020,0010) := \"site-{}\"\n", self.site));
        out.push_str(&format!("(0008,0050) := \"{}\"\n", self.project));
        out.push_str(&format!("(0008,1030) := \"{}\"\n", self.project));
        out.push_str(&format!("(0010,0010) := \"{}\"\n", self.subject_label));
        out.push_str(&format!("(0010,0020) := \"{}\"\n", self.session_id));
        // The receiving archive routes on this comment's exact layout.
        out.push_str(&format!(
            "(0010,4000) := \"Project: {}; Subject: {}; Session: {}; AA:true\"\n",
            self.project, self.subject_label, self.session_id
        ));
        out
    }
}

/// Copy `template` into `dir` and append the directives for `fields`.
pub fn write_script(
    template: &Path,
    dir: &Path,
    fields: &AnonymizationFields<'_>,
) -> io::Result<PathBuf> {
    let script = dir.join(fields.script_name());
    fs::copy(template, &script).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("Error copying {}: {}", template.display(), e),
        )
    })?;
    let mut out = OpenOptions::new().append(true).open(&script)?;
    out.write_all(fields.directives().as_bytes())?;
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fields() -> AnonymizationFields<'static> {
        AnonymizationFields {
            site: "024",
            project: "FMRI_HD_024",
            subject_label: "0001",
            session_id: "77777",
        }
    }

    #[test]
    fn test_script_keeps_template_and_appends_directives() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("base.das");
        fs::write(&template, "(0008,0080) := \"\"\n").unwrap();
        let out_dir = tempdir().unwrap();

        let script = write_script(&template, out_dir.path(), &fields()).unwrap();
        assert_eq!(
            script.file_name().unwrap().to_str().unwrap(),
            "anon-FMRI_HD_024_0001_77777.das"
        );
        let content = fs::read_to_string(&script).unwrap();
        assert!(content.starts_with("(0008,0080) := \"\"\n"));
        assert!(content.contains("(0020,0010) := \"site-024\"\n"));
        assert!(content.contains("(0008,0050) := \"FMRI_HD_024\"\n"));
        assert!(content.contains("(0010,0010) := \"0001\"\n"));
        assert!(content.contains("(0010,0020) := \"77777\"\n"));
        assert!(content.contains(
            "(0010,4000) := \"Project: FMRI_HD_024; Subject: 0001; Session: 77777; AA:true\"\n"
        ));
        // Template untouched.
        assert_eq!(fs::read_to_string(&template).unwrap(), "(0008,0080) := \"\"\n");
    }

    #[test]
    fn test_missing_template_is_an_error() {
        let out_dir = tempdir().unwrap();
        let err = write_script(Path::new("/no/such/base.das"), out_dir.path(), &fields());
        assert!(err.is_err());
    }
}
