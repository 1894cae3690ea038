use std::path::PathBuf;
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::convert::tools::run_tool;
use crate::error::Error;

/// Key under which a new destination session identifier is issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierRequest<'a> {
    pub site: &'a str,
    pub subject_label: &'a str,
    pub date: &'a str,
    pub time: &'a str,
    pub study_uid: &'a str,
}

pub trait IdentifierService {
    fn issue(&self, request: &IdentifierRequest<'_>) -> Result<String, Error>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifierSettings {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Issues identifiers by running an external program:
/// `<program> <args..> <site> <subject> <date> <time> <uid>`.
/// The identifier is the last non-empty line it prints.
pub struct CommandIdentifierService {
    settings: IdentifierSettings,
}

impl CommandIdentifierService {
    pub fn new(settings: IdentifierSettings) -> Self {
        Self { settings }
    }
}

impl IdentifierService for CommandIdentifierService {
    fn issue(&self, request: &IdentifierRequest<'_>) -> Result<String, Error> {
        info!("Generating a new scan ID");
        let output = run_tool(
            Command::new(&self.settings.program)
                .args(&self.settings.args)
                .args([
                    request.site,
                    request.subject_label,
                    request.date,
                    request.time,
                    request.study_uid,
                ]),
        )?;
        let id = last_line(&output).ok_or_else(|| {
            Error::Identifier(format!(
                "{} printed no identifier",
                self.settings.program.display()
            ))
        })?;
        info!("New scan ID={}", id);
        Ok(id)
    }
}

fn last_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
}
