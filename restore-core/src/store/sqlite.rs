use super::connection::{close_pool, create_pool, DbPool};
use super::migrate::migrate;
use super::SnapshotStore;
use crate::models::{RepositoryMeta, Snapshot, SnapshotRecord, SnapshotStats};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use tracing::{debug, info, instrument};

const UPSERT_METADATA: &str = "INSERT INTO snapshots
     (repo_id, id, short_id, time, time_unix, hostname, username, paths, tags, parent, tree)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
     ON CONFLICT(repo_id, id) DO UPDATE SET
       short_id = excluded.short_id,
       time = excluded.time,
       time_unix = excluded.time_unix,
       hostname = excluded.hostname,
       username = excluded.username,
       paths = excluded.paths,
       tags = excluded.tags,
       parent = excluded.parent,
       tree = excluded.tree";

const UPDATE_STATS: &str = "UPDATE snapshots
     SET total_size = ?3, total_file_count = ?4, stats_cached_at = ?5
     WHERE repo_id = ?1 AND id = ?2";

/// SQLite-backed store; every query runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        info!(path = %db_path.display(), "Opening snapshot database");
        let db = create_pool(db_path)?;
        migrate(&db)?;
        Ok(Self { db })
    }

    pub fn close(&self) {
        close_pool(&self.db);
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.get()?;
            f(&mut conn)
        })
        .await?
    }
}

fn upsert_metadata(tx: &Transaction<'_>, repo_id: &str, snapshot: &Snapshot) -> Result<()> {
    let paths = serde_json::to_string(&snapshot.paths)?;
    let tags = snapshot.tags.as_ref().map(serde_json::to_string).transpose()?;
    tx.execute(
        UPSERT_METADATA,
        params![
            repo_id,
            snapshot.id,
            snapshot.short_id,
            snapshot.time.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            snapshot.time.timestamp(),
            snapshot.hostname,
            snapshot.username,
            paths,
            tags,
            snapshot.parent,
            snapshot.tree,
        ],
    )?;
    Ok(())
}

fn row_to_record(row: &Row) -> rusqlite::Result<SnapshotRecord> {
    let time_str: String = row.get("time")?;
    let time_unix: i64 = row.get("time_unix")?;
    let time = DateTime::parse_from_rfc3339(&time_str)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| DateTime::from_timestamp(time_unix, 0))
        .unwrap_or_default();

    let paths: String = row.get("paths")?;
    let tags: Option<String> = row.get("tags")?;
    let total_size: Option<i64> = row.get("total_size")?;
    let total_file_count: Option<i64> = row.get("total_file_count")?;

    let stats = match (total_size, total_file_count) {
        (Some(size), Some(count)) => Some(SnapshotStats {
            total_size: size.max(0) as u64,
            total_file_count: count.max(0) as u64,
        }),
        _ => None,
    };

    Ok(SnapshotRecord {
        snapshot: Snapshot {
            id: row.get("id")?,
            short_id: row.get("short_id")?,
            time,
            hostname: row.get("hostname")?,
            username: row.get("username")?,
            paths: serde_json::from_str(&paths).unwrap_or_default(),
            tags: tags.and_then(|t| serde_json::from_str(&t).ok()),
            parent: row.get("parent")?,
            tree: row.get("tree")?,
        },
        stats,
    })
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    #[instrument(skip(self))]
    async fn load_all(&self, repo_id: &str) -> Result<Vec<SnapshotRecord>> {
        let repo_id = repo_id.to_string();
        let records = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM snapshots WHERE repo_id = ?1 ORDER BY time_unix DESC, id ASC",
                )?;
                let rows = stmt
                    .query_map(params![repo_id], |row| row_to_record(row))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let with_stats = records.iter().filter(|r| r.has_stats()).count();
        debug!(
            count = records.len(),
            with_stats,
            pending = records.len() - with_stats,
            "Loaded snapshots from database"
        );
        Ok(records)
    }

    #[instrument(skip(self, snapshots), fields(count = snapshots.len()))]
    async fn save_metadata_only(&self, repo_id: &str, snapshots: &[Snapshot]) -> Result<()> {
        let repo_id = repo_id.to_string();
        let snapshots = snapshots.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for snapshot in &snapshots {
                upsert_metadata(&tx, &repo_id, snapshot)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn save_batch(&self, repo_id: &str, records: &[SnapshotRecord]) -> Result<()> {
        let repo_id = repo_id.to_string();
        let records = records.to_vec();
        self.with_conn(move |conn| {
            let now = Utc::now().timestamp();
            let tx = conn.transaction()?;
            for record in &records {
                upsert_metadata(&tx, &repo_id, &record.snapshot)?;
                if let Some(stats) = record.stats {
                    tx.execute(
                        UPDATE_STATS,
                        params![
                            repo_id,
                            record.snapshot.id,
                            i64::try_from(stats.total_size).unwrap_or(i64::MAX),
                            i64::try_from(stats.total_file_count).unwrap_or(i64::MAX),
                            now,
                        ],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_cached_ids(&self, repo_id: &str) -> Result<Vec<String>> {
        let repo_id = repo_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT id FROM snapshots WHERE repo_id = ?1")?;
            let ids = stmt
                .query_map(params![repo_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_meta(&self, repo_id: &str) -> Result<RepositoryMeta> {
        let repo_id = repo_id.to_string();
        self.with_conn(move |conn| {
            let meta = conn
                .query_row(
                    "SELECT repo_id, last_delta_check, snapshot_count FROM repo_meta WHERE repo_id = ?1",
                    params![repo_id],
                    |row| {
                        Ok(RepositoryMeta {
                            repo_id: row.get(0)?,
                            last_delta_check: row.get(1)?,
                            snapshot_count: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(meta.unwrap_or(RepositoryMeta {
                repo_id,
                last_delta_check: 0,
                snapshot_count: 0,
            }))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn touch_last_check(&self, repo_id: &str, at: i64) -> Result<()> {
        let repo_id = repo_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO repo_meta (repo_id, last_delta_check, snapshot_count)
                 VALUES (?1, ?2, (SELECT COUNT(*) FROM snapshots WHERE repo_id = ?1))
                 ON CONFLICT(repo_id) DO UPDATE SET
                   last_delta_check = excluded.last_delta_check,
                   snapshot_count = excluded.snapshot_count",
                params![repo_id, at],
            )?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn clear_repository(&self, repo_id: &str) -> Result<()> {
        let repo_id = repo_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM snapshots WHERE repo_id = ?1", params![repo_id])?;
            tx.execute("DELETE FROM repo_meta WHERE repo_id = ?1", params![repo_id])?;
            tx.commit()?;
            info!(repo_id = %repo_id, "Cleared cached snapshots");
            Ok(())
        })
        .await
    }
}
