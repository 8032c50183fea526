//! Backup-tool gateway: every call that spawns the backup tool.

pub mod restic;

use crate::connections::RepositoryConnection;
use crate::models::{FileNode, RestoreOutcome, Snapshot, SnapshotStats, RepositoryStats};
use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub use restic::ResticGateway;

#[async_trait]
pub trait BackupGateway: Send + Sync {
    /// Cheap credential check against the repository.
    async fn verify(&self, conn: &RepositoryConnection) -> Result<()>;

    /// No ordering is guaranteed; callers sort.
    async fn list_snapshots(&self, conn: &RepositoryConnection) -> Result<Vec<Snapshot>>;

    /// One subprocess per call, walks the whole snapshot tree.
    async fn snapshot_stats(&self, conn: &RepositoryConnection, snapshot_id: &str) -> Result<SnapshotStats>;

    async fn repository_stats(&self, conn: &RepositoryConnection) -> Result<RepositoryStats>;

    async fn browse_tree(
        &self,
        conn: &RepositoryConnection,
        snapshot_id: &str,
        path: Option<&str>,
    ) -> Result<Vec<FileNode>>;

    /// Restores into `target` as given; see [`timestamped_target`].
    async fn restore_selective(
        &self,
        conn: &RepositoryConnection,
        snapshot_id: &str,
        target: &Path,
        include_paths: &[String],
    ) -> Result<RestoreOutcome>;

    async fn restore_full(
        &self,
        conn: &RepositoryConnection,
        snapshot_id: &str,
        target: &Path,
    ) -> Result<RestoreOutcome>;
}

/// `<target>/restore-<timestamp>`, so repeated restores never overwrite each other.
pub fn timestamped_target(target: &Path, now: chrono::DateTime<chrono::Utc>) -> PathBuf {
    target.join(format!("restore-{}", now.format("%Y-%m-%d_%H-%M-%S")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamped_target() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let target = timestamped_target(Path::new("/restores"), now);
        assert_eq!(target, PathBuf::from("/restores/restore-2024-05-06_07-08-09"));
    }
}
