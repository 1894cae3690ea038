use chrono::NaiveDate;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "xnat-sync")]
#[command(about = "Sync imaging sessions between XNAT archives and convert them", long_about = None)]
pub struct Cli {
    /// Configuration file name, without extension
    #[arg(long, default_value = "Config")]
    pub config: String,

    /// Only consider sessions inserted on or after this date (YYYYMMDD).
    /// Defaults to today minus the configured interval.
    #[arg(long, value_parser = parse_date)]
    pub inserted_after: Option<NaiveDate>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run every configured task
    Run,
    /// Run only the transfer tasks
    Transfer,
    /// Run only the conversion tasks
    Convert,
    /// Print configuration values
    PrintConfig,
    /// Show how a raw scan type would be classified
    CheckWhitelist {
        /// Raw scan type as recorded in the archive
        scan_type: String,
    },
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y%m%d").map_err(|e| format!("expected YYYYMMDD: {}", e))
}
