use std::env;
use std::path::PathBuf;

use chrono::{Duration, NaiveDate};
use config::{Config, ConfigError, Environment, File as ConfigFile, FileFormat};
use serde::{Deserialize, Serialize};

use crate::cache::CacheSettings;
use crate::convert::tools::ToolPaths;
use crate::engine::SyncTask;
use crate::error::Error;
use crate::transfer::identifier::IdentifierSettings;
use crate::transfer::TransferSettings;

pub const ENV_PREFIX: &str = "XNAT_SYNC";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub paths: PathSettings,
    pub programs: ToolPaths,
    pub source: ArchiveSettings,
    pub destination: ArchiveSettings,
    pub remap: TransferSettings,
    pub identifier: IdentifierSettings,
    #[serde(default)]
    pub tunnel: Option<TunnelSettings>,
    #[serde(default)]
    pub notify: NotifySettings,
    #[serde(default)]
    pub tasks: Vec<SyncTask>,
    /// Destination projects checked after the primary one when looking for
    /// an already transferred session.
    #[serde(default = "default_buckets")]
    pub buckets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    pub destination_base: PathBuf,
    pub whitelist: PathBuf,
    #[serde(default = "default_new_scan_interval_days")]
    pub new_scan_interval_days: u32,
}

/// Connection to one archive. Series are downloaded below `cache.dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveSettings {
    pub url: String,
    pub username: String,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    #[serde(default = "default_ssh")]
    pub program: PathBuf,
    pub user: String,
    pub host: String,
    pub local_port: u16,
    /// `host:port` as seen from the tunnel endpoint.
    pub remote: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySettings {
    /// Program receiving the run summary on stdin. Logged only when unset.
    #[serde(default)]
    pub command: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_subject")]
    pub subject: String,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            subject: default_subject(),
        }
    }
}

fn default_buckets() -> Vec<String> {
    vec![
        "fMRI_COMPAT".to_string(),
        "HDPILOT".to_string(),
        "PHD_000".to_string(),
    ]
}

fn default_new_scan_interval_days() -> u32 {
    7
}

fn default_ssh() -> PathBuf {
    PathBuf::from("ssh")
}

fn default_subject() -> String {
    "xnat-sync summary".to_string()
}

/// Load `<name>.toml` (or any format `config` recognizes) with
/// `XNAT_SYNC__SECTION__KEY` environment overrides.
pub fn load_configuration(name: &str) -> Result<AppConfig, ConfigError> {
    Config::builder()
        .add_source(ConfigFile::with_name(name))
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?
        .try_deserialize::<AppConfig>()
}

pub fn parse_configuration(toml: &str) -> Result<AppConfig, ConfigError> {
    Config::builder()
        .add_source(ConfigFile::from_str(toml, FileFormat::Toml))
        .build()?
        .try_deserialize::<AppConfig>()
}

impl AppConfig {
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Lower bound for session insertion dates relative to `today`.
    pub fn inserted_after(&self, today: NaiveDate) -> NaiveDate {
        inserted_after(self.paths.new_scan_interval_days, today)
    }
}

pub fn inserted_after(days: u32, today: NaiveDate) -> NaiveDate {
    today - Duration::days(i64::from(days))
}

/// Password of an archive account, read from `XNAT_SYNC_<ROLE>_PASSWORD`.
pub fn archive_password(role: &str) -> Result<String, Error> {
    let var = format!("{}_{}_PASSWORD", ENV_PREFIX, role.to_uppercase());
    env::var(&var).map_err(|_| Error::Other(format!("{} is not set", var)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [paths]
        destination_base = "/paulsen/MRx"
        whitelist = "/etc/xnat-sync/whitelist.txt"

        [programs]
        dicom_to_nrrd = "/opt/bin/DicomToNrrdConverter"
        mri_convert = "/opt/freesurfer/bin/mri_convert"
        convert_between_file_formats = "/opt/bin/ConvertBetweenFileFormats"

        [source]
        url = "https://rpacs.example.org"
        username = "sync"
        cache.dir = "/tmp/rpacs"

        [destination]
        url = "https://predict.example.org"
        username = "sync"
        cache.dir = "/tmp/predict"
        cache.free_threshold = 0.2

        [remap]
        remap_command = "/opt/bin/DicomRemap"
        base_anon = "/etc/xnat-sync/base.das"
        dicom_scp = "dicom://predict.example.org:8104/XNAT"

        [identifier]
        program = "/opt/bin/issue-id"

        [[tasks]]
        direction = "transfer"
        source_project = "PHD_024"
        destination_project = "FMRI_HD_024"

        [[tasks]]
        direction = "convert"
        project_pattern = "PHD_%"
    "#;

    #[test]
    fn test_parse_sample_with_defaults() {
        let config = parse_configuration(SAMPLE).unwrap();
        assert_eq!(config.paths.new_scan_interval_days, 7);
        assert_eq!(config.buckets, vec!["fMRI_COMPAT", "HDPILOT", "PHD_000"]);
        assert_eq!(config.source.cache.free_threshold, 0.15);
        assert_eq!(config.destination.cache.free_threshold, 0.2);
        assert_eq!(config.destination.cache.retention_minutes, 30);
        assert!(config.tunnel.is_none());
        assert!(config.notify.command.is_none());
        assert_eq!(config.notify.subject, "xnat-sync summary");
        assert_eq!(config.programs.gzip, PathBuf::from("gzip"));
        assert_eq!(
            config.tasks,
            vec![
                SyncTask::Transfer {
                    source_project: "PHD_024".into(),
                    destination_project: "FMRI_HD_024".into(),
                },
                SyncTask::Convert {
                    project_pattern: "PHD_%".into(),
                },
            ]
        );
    }

    #[test]
    fn test_rendered_config_parses_back() {
        let config = parse_configuration(SAMPLE).unwrap();
        let rendered = config.to_toml().unwrap();
        let again = parse_configuration(&rendered).unwrap();
        assert_eq!(again.tasks, config.tasks);
        assert_eq!(again.paths.destination_base, config.paths.destination_base);
    }

    #[test]
    fn test_inserted_after() {
        let today = NaiveDate::from_ymd_opt(2013, 3, 4).unwrap();
        assert_eq!(
            inserted_after(7, today),
            NaiveDate::from_ymd_opt(2013, 2, 25).unwrap()
        );
        assert_eq!(inserted_after(0, today), today);
    }

    #[test]
    fn test_missing_password_names_the_variable() {
        let err = archive_password("nowhere_role").unwrap_err();
        assert!(err.to_string().contains("XNAT_SYNC_NOWHERE_ROLE_PASSWORD"));
    }
}
