use thiserror::Error;

use crate::archive::ArchiveError;
use crate::convert::dicom::DicomError;
use crate::convert::tools::ToolError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("DICOM error: {0}")]
    Dicom(#[from] DicomError),

    #[error("Invalid destination project '{0}': expected a PHD_* or FMRI_* project")]
    InvalidProject(String),

    #[error("Identifier service error: {0}")]
    Identifier(String),

    #[error("{0}")]
    Other(String),
}
