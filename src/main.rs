mod cli;
mod logging;
mod reporter;

use std::fs;
use std::process;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{CommandFactory, Parser};
use cli::{Cli, Commands};
use colored::*;
use dotenv::dotenv;
use reporter::CliReporter;
use tracing::{error, info};
use xnat_sync::cache::CacheGuardian;
use xnat_sync::classify::{classify, Rejection, WhiteList};
use xnat_sync::config::{archive_password, load_configuration};
use xnat_sync::convert::dicom::DicomFiles;
use xnat_sync::convert::tools::ExternalTools;
use xnat_sync::notify::{self, Notifier};
use xnat_sync::transfer::identifier::CommandIdentifierService;
use xnat_sync::transfer::DicomRemap;
use xnat_sync::tunnel::SshTunnel;
use xnat_sync::{AppConfig, Collaborators, EngineSettings, SyncEngine, SyncReport, SyncTask, XnatClient};

/// Which configured tasks a command runs.
#[derive(Debug, Clone, Copy)]
enum Selection {
    All,
    Transfers,
    Conversions,
}

impl Selection {
    fn includes(self, task: &SyncTask) -> bool {
        match self {
            Selection::All => true,
            Selection::Transfers => matches!(task, SyncTask::Transfer { .. }),
            Selection::Conversions => matches!(task, SyncTask::Convert { .. }),
        }
    }
}

fn main() {
    dotenv().ok();

    let _guard = logging::init_logger();

    let args = Cli::parse();

    let config = match load_configuration(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let selection = match args.command {
        Some(Commands::Run) => Selection::All,
        Some(Commands::Transfer) => Selection::Transfers,
        Some(Commands::Convert) => Selection::Conversions,
        Some(Commands::PrintConfig) => {
            match config.to_toml() {
                Ok(text) => println!("{}", text),
                Err(err) => error!("Error rendering configuration: {}", err),
            }
            return;
        }
        Some(Commands::CheckWhitelist { scan_type }) => {
            if let Err(err) = check_whitelist(&config, &scan_type) {
                error!("Error: {:#}", err);
                process::exit(1);
            }
            return;
        }
        None => {
            let _ = Cli::command().print_long_help();
            return;
        }
    };

    let inserted_after = args
        .inserted_after
        .unwrap_or_else(|| config.inserted_after(Local::now().date_naive()));

    if !run_sync(&config, inserted_after, selection) {
        process::exit(1);
    }
}

/// Run the selected tasks, notify, and tear down. Returns whether the run
/// succeeded.
fn run_sync(config: &AppConfig, inserted_after: NaiveDate, selection: Selection) -> bool {
    let mut tunnel = None;
    let outcome = execute(config, inserted_after, selection, &mut tunnel);

    let (succeeded, body) = match &outcome {
        Ok(report) => {
            print_summary(report);
            (
                !report.has_failures(),
                format!("Synchronization finished.\n{}", report.summary()),
            )
        }
        Err(err) => {
            error!(critical = true, "Synchronization failed: {:#}", err);
            (false, format!("Synchronization FAILED!\n{:#}", err))
        }
    };

    let subject = notify::summary_subject(&config.notify.subject, succeeded);
    if let Err(err) = notify::from_settings(&config.notify).notify(&subject, &body) {
        error!("Error sending summary: {}", err);
    }

    drop(tunnel);
    for cache in [&config.source.cache, &config.destination.cache] {
        CacheGuardian::new(cache.clone()).clear();
    }
    succeeded
}

fn execute(
    config: &AppConfig,
    inserted_after: NaiveDate,
    selection: Selection,
    tunnel: &mut Option<SshTunnel>,
) -> Result<SyncReport> {
    if let Some(settings) = &config.tunnel {
        *tunnel = Some(SshTunnel::open(settings).context("opening ssh tunnel")?);
    }
    for cache in [&config.source.cache, &config.destination.cache] {
        fs::create_dir_all(&cache.dir)
            .with_context(|| format!("creating cache directory {}", cache.dir.display()))?;
    }

    info!("Connecting to {}", config.source.url);
    let source = XnatClient::new(
        &config.source.url,
        &config.source.username,
        &archive_password("source")?,
    )?;
    info!("Connecting to {}", config.destination.url);
    let destination = XnatClient::new(
        &config.destination.url,
        &config.destination.username,
        &archive_password("destination")?,
    )?;

    let whitelist = WhiteList::load(&config.paths.whitelist)
        .with_context(|| format!("reading whitelist {}", config.paths.whitelist.display()))?;
    info!("{} scan types in the whitelist", whitelist.len());

    let tools = ExternalTools::new(config.programs.clone());
    let identifiers = CommandIdentifierService::new(config.identifier.clone());
    let remap = DicomRemap::new(&config.remap.remap_command);

    let engine = SyncEngine::new(
        Collaborators {
            source: &source,
            destination: &destination,
            tools: &tools,
            inspector: &DicomFiles,
            identifiers: &identifiers,
            remap: &remap,
        },
        whitelist,
        EngineSettings {
            destination_base: config.paths.destination_base.clone(),
            legacy_buckets: config.buckets.clone(),
            transfer: config.remap.clone(),
            inserted_after: Some(inserted_after),
        },
    )
    .with_caches(
        Some(CacheGuardian::new(config.source.cache.clone())),
        Some(CacheGuardian::new(config.destination.cache.clone())),
    );

    let tasks: Vec<SyncTask> = config
        .tasks
        .iter()
        .filter(|task| selection.includes(task))
        .cloned()
        .collect();
    info!(
        "Running {} tasks for sessions inserted after {}",
        tasks.len(),
        inserted_after.format("%Y%m%d")
    );

    let reporter = CliReporter::new();
    Ok(engine.run(&tasks, &reporter)?)
}

fn print_summary(report: &SyncReport) {
    println!();
    info!(
        "Transferred: {}, Converted scans: {}, Duration: {}",
        format!("{}", report.transferred()).green(),
        format!("{}", report.converted_scans()).green(),
        format!("{:.2}s", report.duration.as_secs_f64()).green(),
    );
    if report.has_failures() {
        info!(
            "{} failed transfers, {} failed scans",
            format!("{}", report.failed_transfers()).red(),
            format!("{}", report.failed_scans()).red(),
        );
    }
    info!(
        "Cache eviction: {} files, {} bytes",
        format!("{}", report.evictions.files_deleted).cyan(),
        format!("{}", report.evictions.bytes_freed).cyan(),
    );
}

fn check_whitelist(config: &AppConfig, scan_type: &str) -> Result<()> {
    let whitelist = WhiteList::load(&config.paths.whitelist)
        .with_context(|| format!("reading whitelist {}", config.paths.whitelist.display()))?;
    match classify(scan_type, &whitelist) {
        Ok(category) => println!("{} -> {} ({})", scan_type, category, "accepted".green()),
        Err(Rejection::Excluded(category)) => {
            println!("{} -> {} ({})", scan_type, category, "excluded".yellow())
        }
        Err(Rejection::NotWhitelisted) => {
            println!("{} ({})", scan_type, "not in the whitelist".red())
        }
    }
    Ok(())
}
