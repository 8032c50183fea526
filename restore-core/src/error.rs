//! Error types for the restore core.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Repository path cannot be empty")]
    EmptyRepositoryPath,

    #[error("Repository path contains invalid characters")]
    InvalidRepositoryPath,

    #[error("Unsupported repository protocol. Expected one of: {0}")]
    UnsupportedProtocol(String),

    #[error("Remote repository path too short")]
    RemotePathTooShort,

    #[error("Path cannot contain '..' components")]
    PathTraversal,

    #[error("Snapshot ID cannot be empty")]
    EmptySnapshotId,

    #[error("Snapshot ID contains invalid characters")]
    InvalidSnapshotId,

    #[error("Snapshot ID too short (minimum 8 characters)")]
    SnapshotIdTooShort,

    #[error("Snapshot ID too long (maximum 64 characters)")]
    SnapshotIdTooLong,

    #[error("Snapshot ID must be hexadecimal (0-9, a-f)")]
    SnapshotIdNotHex,

    #[error("Target path cannot be empty")]
    EmptyTargetPath,

    #[error("Target path contains invalid characters")]
    InvalidTargetPath,

    #[error("Target path must be absolute (e.g., C:\\restore or /home/user/restore)")]
    RelativeTargetPath,

    #[error("Parent directory does not exist: {0}")]
    ParentDirectoryNotFound(PathBuf),

    #[error("Include path cannot be empty")]
    EmptyIncludePath,

    #[error("Include path contains invalid characters")]
    InvalidIncludePath,

    #[error("Include path contains excessive '..' components (max 3)")]
    ExcessiveParentTraversal,

    #[error("Include path should be relative, not absolute")]
    AbsoluteIncludePath,

    #[error("At least one include path is required for selective restore")]
    NoIncludePaths,

    #[error("Repository ID cannot be empty")]
    EmptyRepoId,

    #[error("Repository ID can only contain letters, numbers, hyphens, and underscores")]
    InvalidRepoIdCharacters,

    #[error("Repository ID too long (maximum 100 characters)")]
    RepoIdTooLong,

    #[error("Password cannot be empty")]
    EmptyPassword,

    #[error("Password contains invalid characters")]
    InvalidPassword,

    #[error("Repository name cannot be empty")]
    EmptyRepositoryName,

    #[error("Repository name too long (maximum 200 characters)")]
    RepositoryNameTooLong,

    #[error("Failed to execute restic: {0}")]
    ResticExecution(String),

    #[error("Restic error: {0}")]
    Restic(String),

    #[error("Restic command timed out after {timeout_secs}s: {command}")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    #[error("Failed to parse snapshots JSON: {0}")]
    SnapshotJsonParse(String),

    #[error("Failed to parse stats JSON: {0}")]
    StatsJsonParse(String),

    #[error("Failed to parse repository stats JSON: {0}")]
    RepoStatsJsonParse(String),

    #[error("Unknown repository: {0}")]
    UnknownRepository(String),

    #[error("Unknown snapshot: {0}")]
    UnknownSnapshot(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Message shown in the `error` observable.
    pub fn user_message(&self) -> String {
        match self {
            CoreError::Restic(stderr) | CoreError::RestoreFailed(stderr) => {
                let line = stderr
                    .lines()
                    .map(str::trim)
                    .find(|l| !l.is_empty())
                    .unwrap_or("restic exited with an error");
                format!("Restic error: {line}")
            }
            other => other.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }

    /// Failures that may succeed on a second attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::ResticExecution(_)
                | CoreError::Restic(_)
                | CoreError::Timeout { .. }
                | CoreError::StatsJsonParse(_)
        )
    }
}
