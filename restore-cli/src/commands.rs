//! Subcommand handlers.

use anyhow::{bail, Context, Result};
use restore_core::cache::{EngineEvent, LoadingState};
use restore_core::config::Config;
use restore_core::gateway::{timestamped_target, BackupGateway, ResticGateway};
use restore_core::models::{NodeKind, SnapshotRecord};
use restore_core::store::SqliteStore;
use restore_core::{ConnectionManager, SnapshotCacheManager};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

pub struct App {
    config: Config,
    connections: ConnectionManager,
    gateway: Arc<ResticGateway>,
    store: Arc<SqliteStore>,
    manager: SnapshotCacheManager,
}

impl App {
    pub fn open(mut config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.storage.data_dir)
            .with_context(|| format!("Failed to create {}", config.storage.data_dir.display()))?;

        let connections = ConnectionManager::open(config.storage.repositories_path())?;
        if config.restic.binary.is_none() {
            config.restic.binary = connections.restic_binary_path();
        }

        let gateway = Arc::new(ResticGateway::new(&config.restic));
        let store = Arc::new(SqliteStore::open(&config.storage.db_path())?);
        let manager = SnapshotCacheManager::new(config.cache.clone(), gateway.clone(), store.clone());

        Ok(Self {
            config,
            connections,
            gateway,
            store,
            manager,
        })
    }

    pub fn close(&self) {
        self.manager.shutdown();
        self.store.close();
    }

    pub fn list_repositories(&self) -> Result<()> {
        let repositories = self.connections.list();
        if repositories.is_empty() {
            println!("No repositories saved");
        }
        for repo in repositories {
            println!("{}  {}  {}", repo.id, repo.name, repo.path);
        }
        Ok(())
    }

    pub fn add_repository(&self, name: &str, path: &str, password: &str) -> Result<()> {
        let repo = self.connections.add(name, path, password)?;
        println!("Added {} ({})", repo.name, repo.id);
        Ok(())
    }

    pub async fn remove_repository(&self, repo_id: &str) -> Result<()> {
        if !self.connections.remove(repo_id)? {
            bail!("Unknown repository: {repo_id}");
        }
        self.manager.forget_repository(repo_id).await?;
        println!("Removed {repo_id}");
        Ok(())
    }

    pub async fn connect(&self, repo_id: &str) -> Result<()> {
        let conn = self.connections.connection(repo_id)?;
        self.gateway.verify(&conn).await?;
        println!("Connected to {}", conn.path);
        Ok(())
    }

    /// Shows the list at once, then follows background refinement until it ends.
    pub async fn snapshots(&self, repo_id: &str, refresh: bool) -> Result<()> {
        let conn = self.connections.connection(repo_id)?;
        let mut events = self.manager.subscribe();

        let outcome = if refresh {
            self.manager.refresh_snapshots(&conn).await?
        } else {
            self.manager.load_snapshots(&conn).await?
        };
        info!(source = ?outcome.source, count = outcome.count, "Snapshots loaded");

        let shown = self.manager.snapshots();
        print_snapshots(&shown);

        let Some(background) = outcome.background else {
            return Ok(());
        };

        let progress = async {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::LoadingChanged { repo_id: id, state }) if id == conn.repo_id => {
                        report_progress(&state)
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        };

        tokio::select! {
            result = background => result.context("Background refresh failed")?,
            _ = progress => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling background work");
                self.manager.shutdown();
                return Ok(());
            }
        }

        let updated = self.manager.snapshots();
        if updated != shown {
            println!();
            print_snapshots(&updated);
        }
        Ok(())
    }

    pub async fn snapshot_stats(&self, repo_id: &str, snapshot_id: &str) -> Result<()> {
        let conn = self.connections.connection(repo_id)?;
        let stats = tokio::select! {
            result = self.manager.load_single_snapshot_stats(&conn, snapshot_id) => result?,
            _ = tokio::signal::ctrl_c() => {
                self.manager.shutdown();
                bail!("Interrupted");
            }
        };
        println!(
            "{snapshot_id}: {} in {} files",
            format_size(stats.total_size),
            stats.total_file_count
        );
        Ok(())
    }

    pub async fn repository_stats(&self, repo_id: &str) -> Result<()> {
        let conn = self.connections.connection(repo_id)?;
        let stats = self.gateway.repository_stats(&conn).await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        Ok(())
    }

    pub async fn browse(&self, repo_id: &str, snapshot_id: &str, path: Option<&str>) -> Result<()> {
        let conn = self.connections.connection(repo_id)?;
        let nodes = self.gateway.browse_tree(&conn, snapshot_id, path).await?;
        for node in nodes {
            let marker = match node.kind {
                NodeKind::Dir => 'd',
                NodeKind::Symlink => 'l',
                NodeKind::File => '-',
                NodeKind::Other => '?',
            };
            let size = node.size.map(format_size).unwrap_or_default();
            println!("{marker} {:>10}  {}", size, node.path);
        }
        Ok(())
    }

    pub async fn restore(&self, repo_id: &str, snapshot_id: &str, target: &Path, include: &[String]) -> Result<()> {
        let conn = self.connections.connection(repo_id)?;
        let target = timestamped_target(target, chrono::Utc::now());

        let outcome = if include.is_empty() {
            self.gateway.restore_full(&conn, snapshot_id, &target).await?
        } else {
            self.gateway
                .restore_selective(&conn, snapshot_id, &target, include)
                .await?
        };

        if let Some(warnings) = &outcome.warnings {
            eprintln!("{warnings}");
        }
        println!(
            "Restored {} item(s) into {}",
            outcome.restored_items,
            outcome.target.display()
        );
        Ok(())
    }

    pub fn config_path(&self) -> Result<()> {
        println!("repositories: {}", self.config.storage.repositories_path().display());
        println!("cache:        {}", self.config.storage.db_path().display());
        Ok(())
    }
}

fn print_snapshots(records: &[SnapshotRecord]) {
    if records.is_empty() {
        println!("No snapshots");
        return;
    }
    for record in records {
        let snapshot = &record.snapshot;
        let stats = match record.stats {
            Some(stats) => format!("{:>10} {:>8} files", format_size(stats.total_size), stats.total_file_count),
            None => format!("{:>10} {:>14}", "-", "-"),
        };
        println!(
            "{}  {}  {:<16} {}  {}",
            snapshot.short_id,
            snapshot.time.format("%Y-%m-%d %H:%M:%S"),
            snapshot.hostname,
            stats,
            snapshot.paths.join(", ")
        );
    }
}

fn report_progress(state: &LoadingState) {
    match state {
        LoadingState::Idle => {}
        LoadingState::BackgroundSync => eprintln!("Checking for new snapshots..."),
        LoadingState::FetchingStats { processed, total } => match total {
            Some(total) => eprintln!("Fetching stats {processed}/{total}"),
            None => eprintln!("Fetching stats {processed}"),
        },
        LoadingState::ManualLoad { snapshot_name } => eprintln!("Loading stats for {snapshot_name}"),
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
