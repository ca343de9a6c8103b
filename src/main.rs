use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use tracing::{debug, error, info, trace};
use tracing_subscriber::EnvFilter;

use rostersync::api::{Credential, SwapcardClient};
use rostersync::cli::{Cli, Commands};
use rostersync::config::SyncConfig;
use rostersync::error::{describe_error_code, exit_status};
use rostersync::pipeline::{self, Pipeline, RunSummary};
use rostersync::run::RunWorkspace;
use rostersync::signals::shutdown_signal;
use rostersync::storage::open_store;
use rostersync::SyncError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = SyncConfig::load(cli.config.as_deref());

    let log_level = match cli.verbose {
        0 => config
            .as_ref()
            .ok()
            .and_then(|c| c.log_level.clone())
            .unwrap_or_else(|| "info".to_string()),
        1 => "debug".to_string(),
        2 => "trace".to_string(),
        _ => "trace,hyper=debug,reqwest=debug,sqlx=debug".to_string(), // -vvv shows everything including dependencies
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose >= 2)
        .with_thread_ids(cli.verbose >= 3)
        .with_line_number(cli.verbose >= 3)
        .init();

    debug!("rostersync started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match config {
        Ok(config) => run_command(cli.command, config).await,
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        let code = e.downcast_ref::<SyncError>().map(SyncError::code);
        match code {
            Some(code) => error!(code, kind = describe_error_code(code), "Fatal error: {:#}", e),
            None => error!("Fatal error: {:#}", e),
        }
        eprintln!("Error: {e:#}");
        std::process::exit(code.map(exit_status).unwrap_or(1));
    }
}

async fn run_command(command: Commands, config: SyncConfig) -> anyhow::Result<()> {
    match command {
        Commands::Run { resume } => {
            let pipeline = build_pipeline(&config).await?;
            let resumable = if resume {
                pipeline.workspace().find_resumable().await?
            } else {
                None
            };
            let summary = match resumable {
                Some(manifest) => {
                    info!(run = %manifest.name, "Continuing unfinished run");
                    pipeline.resume(Some(&manifest.name)).await?
                }
                None => pipeline.run().await?,
            };
            print_summary(&summary);
        }
        Commands::Resume { run } => {
            let pipeline = build_pipeline(&config).await?;
            let summary = pipeline.resume(run.as_deref()).await?;
            print_summary(&summary);
        }
        Commands::Status { json } => {
            let store = open_store(&config.storage).await?;
            let workspace = RunWorkspace::new(config.storage.runs_dir());
            let report = pipeline::status(&workspace, store.as_ref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                match &report.latest_completed {
                    Some(run) => println!(
                        "Latest completed run: #{} at {} ({} attendees, {} new, {} updated)",
                        run.id,
                        run.run_timestamp,
                        run.total_attendees,
                        run.new_attendees,
                        run.updated_attendees
                    ),
                    None => println!("No completed run yet."),
                }
                if let Some(latest) = &report.latest_run {
                    println!("Latest run directory: {}", latest);
                }
                let stats = &report.statistics;
                println!(
                    "Attendees: {} ({} organizations, {} countries, {} industries, {} without detail)",
                    stats.total_attendees,
                    stats.unique_organizations,
                    stats.unique_countries,
                    stats.unique_industries,
                    stats.detail_unavailable
                );
                println!(
                    "Runs: {} ({} completed), change records: {}",
                    stats.total_runs, stats.completed_runs, stats.total_changes
                );
                for manifest in &report.resumable {
                    println!(
                        "Resumable: {} ({}{})",
                        manifest.name,
                        manifest.state,
                        manifest
                            .error
                            .as_ref()
                            .map(|e| format!(": {}", e))
                            .unwrap_or_default()
                    );
                }
            }
        }
        Commands::CheckToken => {
            let credential = credential(&config)?;
            let status = credential.validate(config.api.token_expiry_margin)?;
            match (status.expires_at, status.remaining) {
                (Some(expires_at), Some(remaining)) => println!(
                    "Token valid until {} ({} remaining)",
                    expires_at,
                    humantime_serde::re::humantime::format_duration(std::time::Duration::from_secs(
                        remaining.as_secs()
                    ))
                ),
                _ => println!("Token present (no expiry claim)"),
            }
        }
        Commands::PruneChanges { older_than } => {
            let age = chrono::Duration::from_std(older_than).context("retention age out of range")?;
            let cutoff = Utc::now() - age;
            let store = open_store(&config.storage).await?;
            let removed = pipeline::prune_changes(&config.storage, store.as_ref(), cutoff).await?;
            println!("Removed {} change records older than {}", removed, cutoff);
        }
    }
    Ok(())
}

fn credential(config: &SyncConfig) -> Result<Credential, SyncError> {
    Credential::new(config.token.as_deref().unwrap_or_default())
}

async fn build_pipeline(config: &SyncConfig) -> anyhow::Result<Pipeline> {
    let credential = credential(config)?;
    credential.validate(config.api.token_expiry_margin)?;

    let api = Arc::new(SwapcardClient::new(config.api.clone(), &credential)?);
    let store = open_store(&config.storage).await?;
    Ok(Pipeline::new(config.clone(), api, store, shutdown_signal()))
}

fn print_summary(summary: &RunSummary) {
    let counts = &summary.counts;
    println!(
        "Run {} {}: {} attendees, {} new, {} updated, {} without detail{}",
        summary.run_name,
        summary.state,
        counts.roster,
        counts.new_attendees,
        counts.updated_attendees,
        counts.detail_unavailable,
        if summary.integrity_violations > 0 {
            format!(", {} email conflicts flagged", summary.integrity_violations)
        } else {
            String::new()
        }
    );
}
