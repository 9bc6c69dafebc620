use crate::db::connection::DbPool;
use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
  id TEXT PRIMARY KEY,
  project_id TEXT NOT NULL,
  name TEXT NOT NULL,
  engine TEXT NOT NULL,
  host TEXT NOT NULL DEFAULT '',
  port INTEGER,
  username TEXT,
  password TEXT,
  database_name TEXT NOT NULL,
  max_snapshots INTEGER NOT NULL DEFAULT 7,
  enabled INTEGER NOT NULL DEFAULT 1,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS schedules (
  id TEXT PRIMARY KEY,
  source_id TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
  cron_expression TEXT NOT NULL,
  enabled INTEGER NOT NULL DEFAULT 1,
  last_run_at TEXT,
  created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS snapshots (
  id TEXT PRIMARY KEY,
  source_id TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
  status TEXT NOT NULL DEFAULT 'PENDING' CHECK(status IN ('PENDING','RUNNING','COMPLETED','FAILED')),
  storage_key TEXT,
  compression TEXT NOT NULL DEFAULT 'gzip',
  size_bytes INTEGER NOT NULL DEFAULT 0,
  checksum TEXT,
  error TEXT,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  started_at TEXT,
  completed_at TEXT
);

CREATE TABLE IF NOT EXISTS diffs (
  id TEXT PRIMARY KEY,
  key_a TEXT NOT NULL,
  key_b TEXT,
  engine TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'PENDING' CHECK(status IN ('PENDING','RUNNING','COMPLETED','FAILED')),
  result_key TEXT,
  total_added INTEGER NOT NULL DEFAULT 0,
  total_removed INTEGER NOT NULL DEFAULT 0,
  total_modified INTEGER NOT NULL DEFAULT 0,
  error TEXT,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_snapshots_source_id ON snapshots(source_id);
CREATE INDEX IF NOT EXISTS idx_snapshots_created_at ON snapshots(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_schedules_source_id ON schedules(source_id);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent migrations for databases created by earlier releases
    if !has_column(&conn, "snapshots", "compression")? {
        conn.execute_batch("ALTER TABLE snapshots ADD COLUMN compression TEXT NOT NULL DEFAULT 'gzip'")?;
    }
    if !has_column(&conn, "sources", "max_snapshots")? {
        conn.execute_batch("ALTER TABLE sources ADD COLUMN max_snapshots INTEGER NOT NULL DEFAULT 7")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns.iter().any(|c| c == column))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::memory_pool;

    #[test]
    fn test_migrate_is_idempotent() {
        let pool = memory_pool();
        migrate(&pool).unwrap();
        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        assert!(has_column(&conn, "snapshots", "checksum").unwrap());
        assert!(has_column(&conn, "diffs", "result_key").unwrap());
    }
}
