//! Snapshot data model shared by the gateway, the store and the cache manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One backup point-in-time, as reported by `restic snapshots --json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<String>,
}

impl Snapshot {
    /// Label used in loading indicators.
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.short_id, self.time.format("%Y-%m-%d %H:%M"))
    }
}

/// Expensive per-snapshot statistics from `restic stats --json <id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStats {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_file_count: u64,
}

/// Persisted row: snapshot metadata plus stats once they are known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot: Snapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<SnapshotStats>,
}

impl SnapshotRecord {
    pub fn pending(snapshot: Snapshot) -> Self {
        Self { snapshot, stats: None }
    }

    pub fn with_stats(snapshot: Snapshot, stats: SnapshotStats) -> Self {
        Self {
            snapshot,
            stats: Some(stats),
        }
    }

    pub fn id(&self) -> &str {
        &self.snapshot.id
    }

    /// Full id or short id.
    pub fn matches(&self, snapshot_id: &str) -> bool {
        self.snapshot.id == snapshot_id || self.snapshot.short_id == snapshot_id
    }

    pub fn has_stats(&self) -> bool {
        self.stats.is_some()
    }
}

/// Per-repository sync bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryMeta {
    pub repo_id: String,
    /// Epoch seconds of the last delta check, 0 when never checked.
    pub last_delta_check: i64,
    pub snapshot_count: i64,
}

/// Whole-repository usage from `restic stats --mode raw-data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryStats {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_uncompressed_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_blob_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshots_count: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
    #[serde(other)]
    Other,
}

/// One entry of a snapshot tree listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<String>,
}

/// Result of a restore call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    pub target: std::path::PathBuf,
    pub restored_items: usize,
    /// Non-fatal stderr from restic, when the restore finished with warnings.
    pub warnings: Option<String>,
}

/// Newest first; ties broken by id so the order is stable across reloads.
pub fn sort_newest_first(snapshots: &mut [Snapshot]) {
    snapshots.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| a.id.cmp(&b.id)));
}

pub fn sort_records_newest_first(records: &mut [SnapshotRecord]) {
    records.sort_by(|a, b| {
        b.snapshot
            .time
            .cmp(&a.snapshot.time)
            .then_with(|| a.snapshot.id.cmp(&b.snapshot.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESTIC_SNAPSHOTS: &str = r#"[
        {"time":"2024-03-01T10:00:00.123456789+01:00","tree":"t1","paths":["/home/a"],"hostname":"box","username":"a","id":"aaaaaaaa11","short_id":"aaaaaaaa","program_version":"restic 0.16.4"},
        {"time":"2024-03-02T10:00:00Z","parent":"aaaaaaaa11","tree":"t2","paths":["/home/a"],"hostname":"box","username":"a","tags":["daily"],"id":"bbbbbbbb22","short_id":"bbbbbbbb"}
    ]"#;

    #[test]
    fn test_deserialize_restic_snapshot_list() {
        let snapshots: Vec<Snapshot> = serde_json::from_str(RESTIC_SNAPSHOTS).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].time.timestamp(), 1_709_283_600);
        assert_eq!(snapshots[1].tags.as_deref(), Some(&["daily".to_string()][..]));
        assert_eq!(snapshots[1].parent.as_deref(), Some("aaaaaaaa11"));
    }

    #[test]
    fn test_sort_newest_first() {
        let mut snapshots: Vec<Snapshot> = serde_json::from_str(RESTIC_SNAPSHOTS).unwrap();
        sort_newest_first(&mut snapshots);
        assert_eq!(snapshots[0].short_id, "bbbbbbbb");
        assert_eq!(snapshots[1].short_id, "aaaaaaaa");
    }

    #[test]
    fn test_stats_ignore_extra_fields() {
        let stats: SnapshotStats =
            serde_json::from_str(r#"{"total_size":2048,"total_file_count":12,"snapshots_count":1}"#).unwrap();
        assert_eq!(
            stats,
            SnapshotStats {
                total_size: 2048,
                total_file_count: 12
            }
        );
    }

    #[test]
    fn test_file_node_kind() {
        let node: FileNode = serde_json::from_str(
            r#"{"name":"dev","type":"chardev","path":"/dev/null","struct_type":"node"}"#,
        )
        .unwrap();
        assert_eq!(node.kind, NodeKind::Other);
    }
}
