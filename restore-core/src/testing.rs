//! Test doubles shared by the unit tests.

use crate::cache::Clock;
use crate::connections::RepositoryConnection;
use crate::error::CoreError;
use crate::gateway::BackupGateway;
use crate::store::{SnapshotStore, SqliteStore};
use crate::models::{FileNode, RepositoryMeta, RepositoryStats, RestoreOutcome, Snapshot, SnapshotRecord, SnapshotStats};
use crate::Result;
use async_trait::async_trait;
use chrono::DateTime;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub fn snapshot(id: &str, secs: i64) -> Snapshot {
    Snapshot {
        id: id.to_string(),
        short_id: id.chars().take(8).collect(),
        time: DateTime::from_timestamp(secs, 0).unwrap(),
        hostname: "host".into(),
        username: "user".into(),
        paths: vec!["/data".into()],
        tags: None,
        parent: None,
        tree: None,
    }
}

/// Deterministic stats so repeated syncs produce identical rows.
pub fn stats_for(id: &str) -> SnapshotStats {
    SnapshotStats {
        total_size: 1024 * id.len() as u64,
        total_file_count: id.bytes().map(u64::from).sum(),
    }
}

/// Polls `condition` until it holds; panics after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// In-process stand-in for restic, keyed by repository path.
#[derive(Default)]
pub struct MockGateway {
    snapshots: Mutex<HashMap<String, Vec<Snapshot>>>,
    failing_stats: Mutex<HashSet<String>>,
    failing_listings: Mutex<HashSet<String>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    stats_gates: Mutex<HashMap<String, Arc<Notify>>>,
    list_calls: AtomicUsize,
    stats_calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_snapshots(&self, repo_path: &str, snapshots: Vec<Snapshot>) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(repo_path.to_string(), snapshots);
    }

    pub fn push_snapshot(&self, repo_path: &str, snapshot: Snapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .entry(repo_path.to_string())
            .or_default()
            .push(snapshot);
    }

    pub fn fail_stats(&self, snapshot_id: &str) {
        self.failing_stats.lock().unwrap().insert(snapshot_id.to_string());
    }

    pub fn fail_listing(&self, repo_path: &str) {
        self.failing_listings.lock().unwrap().insert(repo_path.to_string());
    }

    /// The next listing of `repo_path` blocks until the returned gate is notified.
    pub fn gate_listing(&self, repo_path: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(repo_path.to_string(), Arc::clone(&gate));
        gate
    }

    /// The next stats call for `snapshot_id` blocks until the returned gate is notified.
    pub fn gate_stats(&self, snapshot_id: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.stats_gates
            .lock()
            .unwrap()
            .insert(snapshot_id.to_string(), Arc::clone(&gate));
        gate
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn stats_calls(&self) -> Vec<String> {
        self.stats_calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackupGateway for MockGateway {
    async fn verify(&self, conn: &RepositoryConnection) -> Result<()> {
        self.list_snapshots(conn).await.map(|_| ())
    }

    async fn list_snapshots(&self, conn: &RepositoryConnection) -> Result<Vec<Snapshot>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gates.lock().unwrap().remove(&conn.path);
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.failing_listings.lock().unwrap().contains(&conn.path) {
            return Err(CoreError::Restic(
                "Fatal: unable to open config file: Stat: no such file or directory".into(),
            ));
        }
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .get(&conn.path)
            .cloned()
            .unwrap_or_default())
    }

    async fn snapshot_stats(&self, _conn: &RepositoryConnection, snapshot_id: &str) -> Result<SnapshotStats> {
        self.stats_calls.lock().unwrap().push(snapshot_id.to_string());

        let gate = self.stats_gates.lock().unwrap().remove(snapshot_id);
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_stats.lock().unwrap().contains(snapshot_id) {
            return Err(CoreError::Restic(format!("Fatal: no matching ID found for prefix \"{snapshot_id}\"")));
        }
        Ok(stats_for(snapshot_id))
    }

    async fn repository_stats(&self, _conn: &RepositoryConnection) -> Result<RepositoryStats> {
        Ok(RepositoryStats::default())
    }

    async fn browse_tree(
        &self,
        _conn: &RepositoryConnection,
        _snapshot_id: &str,
        _path: Option<&str>,
    ) -> Result<Vec<FileNode>> {
        Ok(Vec::new())
    }

    async fn restore_selective(
        &self,
        _conn: &RepositoryConnection,
        _snapshot_id: &str,
        target: &Path,
        include_paths: &[String],
    ) -> Result<RestoreOutcome> {
        Ok(RestoreOutcome {
            target: target.to_path_buf(),
            restored_items: include_paths.len(),
            warnings: None,
        })
    }

    async fn restore_full(
        &self,
        _conn: &RepositoryConnection,
        _snapshot_id: &str,
        target: &Path,
    ) -> Result<RestoreOutcome> {
        Ok(RestoreOutcome {
            target: target.to_path_buf(),
            restored_items: 0,
            warnings: None,
        })
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(now),
        })
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// `SqliteStore` whose reads or batch writes can be switched to fail.
pub struct FlakyStore {
    inner: SqliteStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: SqliteStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn storage_error() -> CoreError {
        CoreError::Storage("disk I/O error".into())
    }
}

#[async_trait]
impl SnapshotStore for FlakyStore {
    async fn load_all(&self, repo_id: &str) -> Result<Vec<SnapshotRecord>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::storage_error());
        }
        self.inner.load_all(repo_id).await
    }

    async fn save_metadata_only(&self, repo_id: &str, snapshots: &[Snapshot]) -> Result<()> {
        self.inner.save_metadata_only(repo_id, snapshots).await
    }

    async fn save_batch(&self, repo_id: &str, records: &[SnapshotRecord]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::storage_error());
        }
        self.inner.save_batch(repo_id, records).await
    }

    async fn list_cached_ids(&self, repo_id: &str) -> Result<Vec<String>> {
        self.inner.list_cached_ids(repo_id).await
    }

    async fn get_meta(&self, repo_id: &str) -> Result<RepositoryMeta> {
        self.inner.get_meta(repo_id).await
    }

    async fn touch_last_check(&self, repo_id: &str, at: i64) -> Result<()> {
        self.inner.touch_last_check(repo_id, at).await
    }

    async fn clear_repository(&self, repo_id: &str) -> Result<()> {
        self.inner.clear_repository(repo_id).await
    }
}
