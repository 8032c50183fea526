//! Persisted snapshot store, keyed by repository id.

pub mod connection;
pub mod migrate;
pub mod sqlite;

use crate::models::{RepositoryMeta, Snapshot, SnapshotRecord};
use crate::Result;
use async_trait::async_trait;

pub use sqlite::SqliteStore;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Every row of the repository, newest first.
    async fn load_all(&self, repo_id: &str) -> Result<Vec<SnapshotRecord>>;

    /// Upserts metadata; stats already stored are kept.
    async fn save_metadata_only(&self, repo_id: &str, snapshots: &[Snapshot]) -> Result<()>;

    /// Upserts metadata and stats. Records without stats keep the stored ones.
    async fn save_batch(&self, repo_id: &str, records: &[SnapshotRecord]) -> Result<()>;

    /// Ids of every persisted row, with or without stats.
    async fn list_cached_ids(&self, repo_id: &str) -> Result<Vec<String>>;

    /// Zeroed defaults when the repository has never been checked.
    async fn get_meta(&self, repo_id: &str) -> Result<RepositoryMeta>;

    /// Records a delta check at `at` (epoch seconds) and refreshes the row count.
    async fn touch_last_check(&self, repo_id: &str, at: i64) -> Result<()>;

    /// Whole-repository removal, the only way rows are ever deleted.
    async fn clear_repository(&self, repo_id: &str) -> Result<()>;
}
