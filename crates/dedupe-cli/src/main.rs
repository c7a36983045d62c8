use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use dedupe_core::{IdentifierType, RetainPolicy, RunId, Scope};
use dedupe_engine::{
    broken_path, connect, resolve_targets, run_survey, survey_path, DedupeConfig, DedupeRun,
    DriftCheck, StopSignal,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "catalog-dedupe")]
#[command(about = "Detects and removes duplicate datasets in a CKAN catalog. \
By default duplicates are detected and logged but not removed.")]
struct Cli {
    /// Catalog base URL [env: CATALOG_API_URL]
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// API key for write access [env: CATALOG_API_KEY]
    #[arg(long, global = true)]
    api_key: Option<String>,
    /// Identifier stamped into markers, audit files and reports.
    #[arg(long, global = true)]
    run_id: Option<String>,
    /// Directory for the audit logs [env: DEDUPE_AUDIT_DIR]
    #[arg(long, global = true)]
    audit_dir: Option<PathBuf>,
    /// Directory for run reports [env: DEDUPE_REPORTS_DIR]
    #[arg(long, global = true)]
    reports_dir: Option<PathBuf>,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Deduplicate the target organizations (default).
    Run(RunArgs),
    /// Report how much of each organization is duplicated.
    Survey(TargetArgs),
    /// Find indexed duplicates the record store cannot show.
    Check(CheckArgs),
}

#[derive(Debug, Default, Args)]
struct TargetArgs {
    /// Organizations to process; all organizations when none are given.
    organizations: Vec<String>,
    /// Harvest source ids to process.
    #[arg(long = "harvest-source")]
    harvest_sources: Vec<String>,
    /// YAML file listing `organizations` and `harvest_sources`.
    #[arg(long)]
    targets_file: Option<PathBuf>,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    #[command(flatten)]
    targets: TargetArgs,
    /// Actually remove duplicates; without it the run is read-only.
    #[arg(long)]
    commit: bool,
    /// Keep the newest record of each group instead of the oldest.
    #[arg(long)]
    newest: bool,
    /// Give the retained record a duplicate's name when it is shorter.
    #[arg(long)]
    update_name: bool,
    #[arg(long, default_value = "identifier")]
    identifier_type: IdentifierType,
    /// Only deduplicate collection parents.
    #[arg(long)]
    collections: bool,
    /// Walk identifier groups from the end of the list.
    #[arg(long)]
    reverse: bool,
    /// Run two engines per organization from opposite ends.
    #[arg(long)]
    split: bool,
    #[arg(long)]
    batch_size: Option<u64>,
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[command(flatten)]
    targets: TargetArgs,
    #[arg(long, default_value = "identifier")]
    identifier_type: IdentifierType,
}

impl Cli {
    fn config(&self, targets: &TargetArgs) -> Result<DedupeConfig> {
        let mut config = DedupeConfig::from_env();
        if let Some(api_url) = &self.api_url {
            config.api_url = api_url.clone();
        }
        if let Some(api_key) = &self.api_key {
            config.api_key = Some(api_key.clone());
        }
        if let Some(run_id) = &self.run_id {
            config.run_id = RunId::from(run_id.as_str());
        }
        if let Some(dir) = &self.audit_dir {
            config.audit_dir = dir.clone();
        }
        if let Some(dir) = &self.reports_dir {
            config.reports_dir = dir.clone();
        }
        config.targets = targets
            .organizations
            .iter()
            .cloned()
            .map(Scope::Organization)
            .chain(targets.harvest_sources.iter().cloned().map(Scope::HarvestSource))
            .collect();
        match &targets.targets_file {
            Some(path) => config.with_targets_file(path),
            None => Ok(config),
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn stop_on_ctrl_c() -> StopSignal {
    let stop = StopSignal::new();
    let handle = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("stopping any in-progress dedupers");
            handle.stop();
        }
    });
    stop
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let stop = stop_on_ctrl_c();

    match cli.command.as_ref().unwrap_or(&Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let mut config = cli.config(&args.targets)?;
            config.dry_run = !args.commit;
            if args.newest {
                config.retain = RetainPolicy::Newest;
            }
            config.update_name = args.update_name;
            config.identifier_type = args.identifier_type;
            config.collections_only = args.collections;
            config.reverse = args.reverse;
            config.split = args.split;
            if let Some(batch_size) = args.batch_size.filter(|b| *b > 0) {
                config.batch_size = batch_size;
            }
            info!(run_id = %config.run_id, "starting");

            let summary = DedupeRun::from_config(config, stop).await?.run().await?;
            println!(
                "dedupe complete: run_id={} dry_run={} scopes={} duplicates={} removed={} stopped={} reports={}",
                summary.report.run_id,
                summary.report.dry_run,
                summary.report.scopes.len(),
                summary.report.total_duplicates(),
                summary.report.total_removed(),
                summary.report.stopped,
                summary.reports_dir
            );
        }
        Commands::Survey(targets) => {
            let config = cli.config(targets)?;
            let api = connect(&config)?;
            let scopes = resolve_targets(api.as_ref(), &config.targets).await?;
            let out = survey_path(&config.audit_dir, &config.run_id);
            let rows = run_survey(api.as_ref(), &scopes, &out, &stop).await?;
            println!(
                "survey complete: run_id={} scopes={} report={}",
                config.run_id,
                rows.len(),
                out.display()
            );
        }
        Commands::Check(args) => {
            let config = cli.config(&args.targets)?;
            let api = connect(&config)?;
            let scopes = resolve_targets(api.as_ref(), &config.targets).await?;
            let out = broken_path(&config.audit_dir, &config.run_id);
            let summary = DriftCheck::new(api.as_ref(), args.identifier_type, config.batch_size, stop)
                .run(&scopes, &out)
                .await?;
            println!(
                "check complete: run_id={} checked={} broken={} report={}",
                config.run_id,
                summary.checked,
                summary.broken,
                out.display()
            );
        }
    }

    Ok(())
}
