use super::connection::DbPool;
use crate::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
  repo_id TEXT NOT NULL,
  id TEXT NOT NULL,
  short_id TEXT NOT NULL,
  time TEXT NOT NULL,
  time_unix INTEGER NOT NULL,
  hostname TEXT NOT NULL DEFAULT '',
  username TEXT NOT NULL DEFAULT '',
  paths TEXT NOT NULL DEFAULT '[]',
  tags TEXT,
  parent TEXT,
  tree TEXT,
  total_size INTEGER,
  total_file_count INTEGER,
  stats_cached_at INTEGER,
  created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
  PRIMARY KEY (repo_id, id)
);

CREATE TABLE IF NOT EXISTS repo_meta (
  repo_id TEXT PRIMARY KEY,
  last_delta_check INTEGER NOT NULL DEFAULT 0,
  snapshot_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_snapshots_repo_time ON snapshots(repo_id, time_unix DESC);
"#;

pub fn migrate(pool: &DbPool) -> Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent migrations for existing databases
    let has_column = |table: &str, column: &str| -> Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns.iter().any(|c| c == column))
    };

    if !has_column("snapshots", "stats_cached_at")? {
        conn.execute_batch("ALTER TABLE snapshots ADD COLUMN stats_cached_at INTEGER")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
