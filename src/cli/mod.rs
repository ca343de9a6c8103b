//! Command-line interface definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Incrementally synchronize an event's attendee directory into a local store
#[derive(Debug, Parser)]
#[command(name = "rostersync")]
#[command(about = "rostersync - incremental attendee roster synchronization", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file (defaults to ./rostersync.toml when present)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List, enrich and merge the attendee directory
    #[command(name = "run")]
    Run {
        /// Continue the newest unfinished run instead of starting a new one
        #[arg(long)]
        resume: bool,
    },

    /// Resume an interrupted or failed run
    #[command(name = "resume")]
    Resume {
        /// Run directory name (YYYY-MM-DD_HHMMSS); newest resumable if omitted
        run: Option<String>,
    },

    /// Show the latest completed run, store statistics and resumable runs
    #[command(name = "status")]
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that the configured bearer token is present and not expired
    #[command(name = "check-token")]
    CheckToken,

    /// Delete change records older than the given age
    #[command(name = "prune-changes")]
    PruneChanges {
        /// Age such as "90d" or "12weeks"
        #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
        older_than: Duration,
    },
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_prune_duration() {
        let cli = Cli::try_parse_from(["rostersync", "prune-changes", "--older-than", "90d"]).unwrap();
        match cli.command {
            Commands::PruneChanges { older_than } => {
                assert_eq!(older_than, Duration::from_secs(90 * 24 * 60 * 60))
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["rostersync", "run", "--resume", "-vv", "--config", "x.toml"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(cli.command, Commands::Run { resume: true }));
    }
}
