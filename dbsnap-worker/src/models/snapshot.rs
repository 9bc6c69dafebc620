use rusqlite::{params, Connection, Row};
use serde::Serialize;
use uuid::Uuid;

pub const STATUS_PENDING: &str = "PENDING";
pub const STATUS_RUNNING: &str = "RUNNING";
pub const STATUS_COMPLETED: &str = "COMPLETED";
pub const STATUS_FAILED: &str = "FAILED";

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub id: String,
    pub source_id: String,
    pub status: String,
    pub storage_key: Option<String>,
    pub compression: String,
    pub size_bytes: i64,
    pub checksum: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

fn row_to_snapshot(row: &Row) -> rusqlite::Result<Snapshot> {
    Ok(Snapshot {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        status: row.get("status")?,
        storage_key: row.get("storage_key")?,
        compression: row.get("compression")?,
        size_bytes: row.get("size_bytes")?,
        checksum: row.get("checksum")?,
        error: row.get("error")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
    })
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<Snapshot>> {
    let mut stmt = conn.prepare("SELECT * FROM snapshots WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_snapshot)?;
    Ok(rows.next().transpose()?)
}

pub fn find_by_source_id(conn: &Connection, source_id: &str) -> anyhow::Result<Vec<Snapshot>> {
    let mut stmt = conn.prepare("SELECT * FROM snapshots WHERE source_id = ? ORDER BY created_at DESC, rowid DESC")?;
    let rows = stmt.query_map(params![source_id], row_to_snapshot)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Completed snapshots of a source, newest first.
pub fn find_completed(conn: &Connection, source_id: &str) -> anyhow::Result<Vec<Snapshot>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM snapshots WHERE source_id = ? AND status = 'COMPLETED'
         ORDER BY completed_at DESC, rowid DESC",
    )?;
    let rows = stmt.query_map(params![source_id], row_to_snapshot)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// The newest completed snapshot of a source other than `exclude_id`.
pub fn find_previous_completed(conn: &Connection, source_id: &str, exclude_id: &str) -> anyhow::Result<Option<Snapshot>> {
    Ok(find_completed(conn, source_id)?
        .into_iter()
        .find(|s| s.id != exclude_id))
}

/// Whether a snapshot of the source is queued or running.
pub fn has_in_flight(conn: &Connection, source_id: &str) -> anyhow::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM snapshots WHERE source_id = ? AND status IN ('PENDING', 'RUNNING')",
        params![source_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Fails every PENDING or RUNNING snapshot. Queue state lives in memory, so
/// after a restart nothing will ever finish them.
pub fn fail_interrupted(conn: &Connection) -> anyhow::Result<usize> {
    let now = chrono::Utc::now().to_rfc3339();
    let changes = conn.execute(
        "UPDATE snapshots SET status = ?, error = ?, completed_at = ? WHERE status IN ('PENDING', 'RUNNING')",
        params![STATUS_FAILED, "interrupted by worker restart", now],
    )?;
    Ok(changes)
}

pub fn create(conn: &Connection, source_id: &str, compression: &str) -> anyhow::Result<Snapshot> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO snapshots (id, source_id, status, compression, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, source_id, STATUS_PENDING, compression, now],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created snapshot"))
}

pub fn mark_running(conn: &Connection, id: &str) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE snapshots SET status = ?, started_at = ?, error = NULL WHERE id = ?",
        params![STATUS_RUNNING, now, id],
    )?;
    Ok(())
}

pub fn mark_completed(conn: &Connection, id: &str, storage_key: &str, size_bytes: i64, checksum: &str) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE snapshots SET status = ?, storage_key = ?, size_bytes = ?, checksum = ?, completed_at = ? WHERE id = ?",
        params![STATUS_COMPLETED, storage_key, size_bytes, checksum, now, id],
    )?;
    Ok(())
}

pub fn mark_failed(conn: &Connection, id: &str, error: &str) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE snapshots SET status = ?, error = ?, completed_at = ? WHERE id = ?",
        params![STATUS_FAILED, error, now, id],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM snapshots WHERE id = ?", params![id])?;
    Ok(changes > 0)
}
