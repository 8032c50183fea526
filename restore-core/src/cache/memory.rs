//! Process-lifetime, time-bounded snapshot cache per repository.

use crate::models::{sort_records_newest_first, Snapshot, SnapshotRecord, SnapshotStats};
use dashmap::DashMap;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct RepositoryCache {
    /// Newest first.
    pub records: Vec<SnapshotRecord>,
    /// Epoch seconds.
    pub loaded_at: i64,
}

impl RepositoryCache {
    pub fn is_fresh(&self, now: i64, ttl_secs: u64) -> bool {
        now.saturating_sub(self.loaded_at) < ttl_secs as i64
    }

    pub fn missing_stats(&self) -> Vec<Snapshot> {
        missing_stats(&self.records)
    }
}

pub fn missing_stats(records: &[SnapshotRecord]) -> Vec<Snapshot> {
    records
        .iter()
        .filter(|r| !r.has_stats())
        .map(|r| r.snapshot.clone())
        .collect()
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, RepositoryCache>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&self, repo_id: &str, now: i64, ttl_secs: u64) -> Option<RepositoryCache> {
        self.entries
            .get(repo_id)
            .filter(|entry| entry.is_fresh(now, ttl_secs))
            .map(|entry| entry.clone())
    }

    pub fn records(&self, repo_id: &str) -> Option<Vec<SnapshotRecord>> {
        self.entries.get(repo_id).map(|entry| entry.records.clone())
    }

    pub fn find(&self, repo_id: &str, snapshot_id: &str) -> Option<SnapshotRecord> {
        self.entries
            .get(repo_id)
            .and_then(|entry| entry.records.iter().find(|r| r.matches(snapshot_id)).cloned())
    }

    /// Full (re)load: resets the entry's age.
    pub fn store(&self, repo_id: &str, records: Vec<SnapshotRecord>, now: i64) {
        self.entries.insert(
            repo_id.to_string(),
            RepositoryCache {
                records,
                loaded_at: now,
            },
        );
    }

    /// Resets the entry's age; an evicted entry stays evicted.
    pub fn touch(&self, repo_id: &str, now: i64) {
        if let Some(mut entry) = self.entries.get_mut(repo_id) {
            entry.loaded_at = now;
        }
    }

    /// Upserts by id; a record without stats never erases known stats.
    /// Does nothing (and returns false) for an evicted entry.
    pub fn merge_records(&self, repo_id: &str, incoming: &[SnapshotRecord]) -> bool {
        let Some(mut entry) = self.entries.get_mut(repo_id) else {
            return false;
        };
        let mut positions: HashMap<String, usize> = entry
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id().to_string(), i))
            .collect();
        for record in incoming {
            match positions.get(record.id()) {
                Some(&i) => {
                    let existing = &mut entry.records[i];
                    existing.snapshot = record.snapshot.clone();
                    if record.stats.is_some() {
                        existing.stats = record.stats;
                    }
                }
                None => {
                    positions.insert(record.id().to_string(), entry.records.len());
                    entry.records.push(record.clone());
                }
            }
        }
        sort_records_newest_first(&mut entry.records);
        true
    }

    pub fn merge_stats(&self, repo_id: &str, snapshot_id: &str, stats: SnapshotStats) -> bool {
        let Some(mut entry) = self.entries.get_mut(repo_id) else {
            return false;
        };
        match entry.records.iter_mut().find(|r| r.id() == snapshot_id) {
            Some(record) => {
                record.stats = Some(stats);
                true
            }
            None => false,
        }
    }

    pub fn evict(&self, repo_id: &str) {
        self.entries.remove(repo_id);
    }
}
