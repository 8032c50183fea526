//! `restic` subprocess implementation of the gateway.

use super::BackupGateway;
use crate::config::ResticConfig;
use crate::connections::RepositoryConnection;
use crate::error::CoreError;
use crate::models::{FileNode, RepositoryStats, RestoreOutcome, Snapshot, SnapshotStats};
use crate::validate;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// How a non-zero restic exit is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorMode {
    Strict,
    /// Restores: only repository-level failures are fatal, the rest are warnings.
    Lenient,
}

#[derive(Debug)]
enum CommandOutput {
    Success(String),
    Warnings(String),
}

#[derive(Debug, Clone)]
pub struct ResticGateway {
    binary: PathBuf,
    command_timeout: Duration,
}

impl ResticGateway {
    pub fn new(config: &ResticConfig) -> Self {
        let binary = config.binary.clone().unwrap_or_else(find_restic_binary);
        debug!(binary = %binary.display(), "Using restic binary");
        Self {
            binary,
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run(&self, conn: &RepositoryConnection, args: &[&str], mode: ErrorMode) -> Result<CommandOutput> {
        let command_repr = format!("restic {}", args.join(" "));

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-r")
            .arg(&conn.path)
            .args(args)
            .env("RESTIC_PASSWORD", &conn.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        debug!(repo_id = %conn.repo_id, command = %command_repr, "Running restic");

        let output = match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Err(_) => {
                return Err(CoreError::Timeout {
                    command: command_repr,
                    timeout_secs: self.command_timeout.as_secs(),
                })
            }
            Ok(Err(e)) => return Err(CoreError::ResticExecution(e.to_string())),
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            return Ok(CommandOutput::Success(stdout));
        }
        classify_failure(mode, stderr)
    }

    async fn run_strict(&self, conn: &RepositoryConnection, args: &[&str]) -> Result<String> {
        match self.run(conn, args, ErrorMode::Strict).await? {
            CommandOutput::Success(stdout) | CommandOutput::Warnings(stdout) => Ok(stdout),
        }
    }

    async fn run_restore(
        &self,
        conn: &RepositoryConnection,
        snapshot_id: &str,
        target: &Path,
        include_paths: &[String],
    ) -> Result<RestoreOutcome> {
        let target_str = target.to_string_lossy().to_string();
        let mut args: Vec<&str> = vec!["restore", snapshot_id, "--target", &target_str];
        for include in include_paths {
            args.push("--include");
            args.push(include);
        }

        let warnings = match self.run(conn, &args, ErrorMode::Lenient).await? {
            CommandOutput::Success(_) => None,
            CommandOutput::Warnings(stderr) => {
                warn!(repo_id = %conn.repo_id, snapshot_id, "Restore finished with warnings");
                Some(stderr)
            }
        };

        Ok(RestoreOutcome {
            target: target.to_path_buf(),
            restored_items: include_paths.len(),
            warnings,
        })
    }
}

fn classify_failure(mode: ErrorMode, stderr: String) -> Result<CommandOutput> {
    match mode {
        ErrorMode::Strict => Err(CoreError::Restic(stderr)),
        ErrorMode::Lenient => {
            let fatal = stderr.contains("repository does not exist")
                || stderr.contains("wrong password")
                || stderr.contains("unable to open repository")
                || (stderr.contains("snapshot") && stderr.contains("not found"));
            if fatal {
                Err(CoreError::RestoreFailed(stderr))
            } else {
                Ok(CommandOutput::Warnings(stderr))
            }
        }
    }
}

fn validate_connection(conn: &RepositoryConnection) -> Result<()> {
    validate::repository_path(&conn.path)?;
    validate::password(&conn.password)
}

fn parse_snapshots(output: &str) -> Result<Vec<Snapshot>> {
    serde_json::from_str(output).map_err(|e| CoreError::SnapshotJsonParse(e.to_string()))
}

fn parse_stats(output: &str) -> Result<SnapshotStats> {
    serde_json::from_str(output.trim()).map_err(|e| CoreError::StatsJsonParse(e.to_string()))
}

fn parse_repository_stats(output: &str) -> Result<RepositoryStats> {
    serde_json::from_str(output.trim()).map_err(|e| CoreError::RepoStatsJsonParse(e.to_string()))
}

/// `restic ls --json` prints one JSON object per line; only `node` lines are entries.
fn parse_tree(output: &str) -> Vec<FileNode> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(|val| val.get("struct_type").and_then(Value::as_str) == Some("node"))
        .filter_map(|val| serde_json::from_value::<FileNode>(val).ok())
        .collect()
}

fn find_restic_binary() -> PathBuf {
    #[cfg(target_os = "macos")]
    let platform_locations: Vec<PathBuf> = vec![
        PathBuf::from("/opt/homebrew/bin/restic"),
        PathBuf::from("/usr/local/bin/restic"),
        PathBuf::from("/usr/bin/restic"),
    ];

    #[cfg(target_os = "windows")]
    let platform_locations: Vec<PathBuf> = {
        let mut locations = Vec::new();
        if let Some(home) = dirs::home_dir() {
            locations.push(home.join("scoop\\shims\\restic.exe"));
        }
        locations.push(PathBuf::from("C:\\Program Files\\Restic\\restic.exe"));
        locations.push(PathBuf::from("C:\\Program Files (x86)\\Restic\\restic.exe"));
        locations
    };

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let platform_locations: Vec<PathBuf> = Vec::new();

    platform_locations
        .into_iter()
        .find(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from("restic"))
}

#[async_trait]
impl BackupGateway for ResticGateway {
    async fn verify(&self, conn: &RepositoryConnection) -> Result<()> {
        validate_connection(conn)?;
        self.run_strict(conn, &["snapshots", "--latest", "1", "--json"]).await?;
        Ok(())
    }

    async fn list_snapshots(&self, conn: &RepositoryConnection) -> Result<Vec<Snapshot>> {
        validate_connection(conn)?;
        let output = self.run_strict(conn, &["snapshots", "--json"]).await?;
        parse_snapshots(&output)
    }

    async fn snapshot_stats(&self, conn: &RepositoryConnection, snapshot_id: &str) -> Result<SnapshotStats> {
        validate_connection(conn)?;
        validate::snapshot_id(snapshot_id)?;
        let output = self.run_strict(conn, &["stats", "--json", snapshot_id]).await?;
        parse_stats(&output)
    }

    async fn repository_stats(&self, conn: &RepositoryConnection) -> Result<RepositoryStats> {
        validate_connection(conn)?;
        let output = self
            .run_strict(conn, &["stats", "--json", "--mode", "raw-data"])
            .await?;
        parse_repository_stats(&output)
    }

    async fn browse_tree(
        &self,
        conn: &RepositoryConnection,
        snapshot_id: &str,
        path: Option<&str>,
    ) -> Result<Vec<FileNode>> {
        validate_connection(conn)?;
        validate::snapshot_id(snapshot_id)?;
        if let Some(p) = path {
            validate::include_path(p)?;
        }

        let mut args = vec!["ls", "--json", snapshot_id];
        if let Some(p) = path {
            args.push(p);
        }
        let output = self.run_strict(conn, &args).await?;
        Ok(parse_tree(&output))
    }

    async fn restore_selective(
        &self,
        conn: &RepositoryConnection,
        snapshot_id: &str,
        target: &Path,
        include_paths: &[String],
    ) -> Result<RestoreOutcome> {
        validate_connection(conn)?;
        validate::snapshot_id(snapshot_id)?;
        let target = validate::target_path(&target.to_string_lossy())?;
        if include_paths.is_empty() {
            return Err(CoreError::NoIncludePaths);
        }
        for include in include_paths {
            validate::include_path(include)?;
        }
        self.run_restore(conn, snapshot_id, &target, include_paths).await
    }

    async fn restore_full(
        &self,
        conn: &RepositoryConnection,
        snapshot_id: &str,
        target: &Path,
    ) -> Result<RestoreOutcome> {
        validate_connection(conn)?;
        validate::snapshot_id(snapshot_id)?;
        let target = validate::target_path(&target.to_string_lossy())?;
        self.run_restore(conn, snapshot_id, &target, &[]).await
    }
}
