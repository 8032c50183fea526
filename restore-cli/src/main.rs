//! Restore CLI - Main entry point
//!
//! Browse and restore restic snapshots with cached snapshot metadata.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::App;
use restore_core::{config::Config, logging};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage saved repositories
    Repos {
        #[command(subcommand)]
        action: ReposCommand,
    },
    /// Check that a saved repository opens with its password
    Connect { repo_id: String },
    /// List snapshots, then wait for stats to fill in
    Snapshots { repo_id: String },
    /// Reload snapshots and look for new ones right away
    Refresh { repo_id: String },
    /// Fetch stats for one snapshot
    Stats { repo_id: String, snapshot_id: String },
    /// Whole-repository usage
    RepoStats { repo_id: String },
    /// List one directory level of a snapshot
    Browse {
        repo_id: String,
        snapshot_id: String,
        path: Option<String>,
    },
    /// Restore a snapshot, or only the included paths, into a new folder under TARGET
    Restore {
        repo_id: String,
        snapshot_id: String,
        #[arg(long, value_name = "TARGET")]
        target: PathBuf,
        #[arg(long = "include", value_name = "PATH")]
        include: Vec<String>,
    },
    /// Print where repositories and the snapshot cache are stored
    ConfigPath,
}

#[derive(Subcommand, Debug)]
enum ReposCommand {
    List,
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        path: String,
        #[arg(long, env = "RESTIC_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Remove a repository and everything cached for it
    Remove { repo_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    logging::init(log_level)?;

    tracing::debug!("Starting restore v{}", env!("CARGO_PKG_VERSION"));

    let app = App::open(config)?;
    let result = match args.command {
        Command::Repos { action } => match action {
            ReposCommand::List => app.list_repositories(),
            ReposCommand::Add { name, path, password } => app.add_repository(&name, &path, &password),
            ReposCommand::Remove { repo_id } => app.remove_repository(&repo_id).await,
        },
        Command::Connect { repo_id } => app.connect(&repo_id).await,
        Command::Snapshots { repo_id } => app.snapshots(&repo_id, false).await,
        Command::Refresh { repo_id } => app.snapshots(&repo_id, true).await,
        Command::Stats { repo_id, snapshot_id } => app.snapshot_stats(&repo_id, &snapshot_id).await,
        Command::RepoStats { repo_id } => app.repository_stats(&repo_id).await,
        Command::Browse {
            repo_id,
            snapshot_id,
            path,
        } => app.browse(&repo_id, &snapshot_id, path.as_deref()).await,
        Command::Restore {
            repo_id,
            snapshot_id,
            target,
            include,
        } => app.restore(&repo_id, &snapshot_id, &target, &include).await,
        Command::ConfigPath => app.config_path(),
    };

    app.close();
    result
}
