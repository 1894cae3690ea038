use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{info, warn};

use crate::config::NotifySettings;
use crate::convert::tools::ToolError;

/// Delivers the end-of-run summary.
pub trait Notifier {
    fn notify(&self, subject: &str, body: &str) -> Result<(), ToolError>;
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, body: &str) -> Result<(), ToolError> {
        info!("{}\n{}", subject, body);
        Ok(())
    }
}

/// Runs `<program> <args..> <subject>` with the body on stdin, e.g. a
/// `mail -s` wrapper.
pub struct CommandNotifier {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandNotifier {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, subject: &str, body: &str) -> Result<(), ToolError> {
        let program = self.program.display().to_string();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(subject)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: program.clone(),
                source,
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(body.as_bytes())?;
        }
        let status = child.wait()?;
        if !status.success() {
            warn!("{} exited with {}", program, status);
            return Err(ToolError::Failed {
                program,
                status: status.to_string(),
                output: String::new(),
            });
        }
        Ok(())
    }
}

/// Notifier selected by the `[notify]` section.
pub fn from_settings(settings: &NotifySettings) -> Box<dyn Notifier> {
    match &settings.command {
        Some(program) => Box::new(CommandNotifier::new(program, settings.args.clone())),
        None => Box::new(LogNotifier),
    }
}

/// Subject line of the summary; failed runs are prefixed.
pub fn summary_subject(subject: &str, succeeded: bool) -> String {
    if succeeded {
        subject.to_string()
    } else {
        format!("FAILED - {}", subject)
    }
}
