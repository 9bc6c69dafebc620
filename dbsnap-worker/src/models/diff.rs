use super::snapshot::{STATUS_COMPLETED, STATUS_FAILED, STATUS_PENDING, STATUS_RUNNING};
use dbsnap_core::diff::DiffSummary;
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct DiffRecord {
    pub id: String,
    pub key_a: String,
    pub key_b: Option<String>,
    pub engine: String,
    pub status: String,
    pub result_key: Option<String>,
    pub total_added: i64,
    pub total_removed: i64,
    pub total_modified: i64,
    pub error: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

fn row_to_diff(row: &Row) -> rusqlite::Result<DiffRecord> {
    Ok(DiffRecord {
        id: row.get("id")?,
        key_a: row.get("key_a")?,
        key_b: row.get("key_b")?,
        engine: row.get("engine")?,
        status: row.get("status")?,
        result_key: row.get("result_key")?,
        total_added: row.get("total_added")?,
        total_removed: row.get("total_removed")?,
        total_modified: row.get("total_modified")?,
        error: row.get("error")?,
        created_at: row.get("created_at")?,
        completed_at: row.get("completed_at")?,
    })
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<DiffRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM diffs WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_diff)?;
    Ok(rows.next().transpose()?)
}

/// `key_b` is `None` for a diff against a live database.
pub fn create(conn: &Connection, key_a: &str, key_b: Option<&str>, engine: &str) -> anyhow::Result<DiffRecord> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO diffs (id, key_a, key_b, engine, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, key_a, key_b, engine, STATUS_PENDING, now],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created diff"))
}

pub fn mark_running(conn: &Connection, id: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE diffs SET status = ?, error = NULL WHERE id = ?",
        params![STATUS_RUNNING, id],
    )?;
    Ok(())
}

pub fn mark_completed(conn: &Connection, id: &str, result_key: &str, summary: &DiffSummary) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE diffs SET status = ?, result_key = ?, total_added = ?, total_removed = ?, total_modified = ?, completed_at = ?
         WHERE id = ?",
        params![
            STATUS_COMPLETED,
            result_key,
            summary.total_added as i64,
            summary.total_removed as i64,
            summary.total_modified as i64,
            now,
            id
        ],
    )?;
    Ok(())
}

pub fn mark_failed(conn: &Connection, id: &str, error: &str) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE diffs SET status = ?, error = ?, completed_at = ? WHERE id = ?",
        params![STATUS_FAILED, error, now, id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::memory_pool;
    use crate::db::migrate::migrate;

    #[test]
    fn test_completed_diff_keeps_counts() {
        let pool = memory_pool();
        migrate(&pool).unwrap();
        let conn = pool.get().unwrap();

        let diff = create(&conn, "snapshots/p/a.jsonl.gz", None, "postgresql").unwrap();
        assert_eq!(diff.status, STATUS_PENDING);
        assert!(diff.key_b.is_none());

        mark_running(&conn, &diff.id).unwrap();
        mark_completed(
            &conn,
            &diff.id,
            "diffs/x.json",
            &DiffSummary {
                total_added: 2,
                total_removed: 1,
                total_modified: 4,
            },
        )
        .unwrap();

        let stored = find_by_id(&conn, &diff.id).unwrap().unwrap();
        assert_eq!(stored.status, STATUS_COMPLETED);
        assert_eq!(stored.result_key.as_deref(), Some("diffs/x.json"));
        assert_eq!((stored.total_added, stored.total_removed, stored.total_modified), (2, 1, 4));
    }
}
