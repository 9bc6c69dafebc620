use rusqlite::{params, Connection, Row};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    pub id: String,
    pub source_id: String,
    pub cron_expression: String,
    pub enabled: i64,
    pub last_run_at: Option<String>,
    pub created_at: String,
}

fn row_to_schedule(row: &Row) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        cron_expression: row.get("cron_expression")?,
        enabled: row.get("enabled")?,
        last_run_at: row.get("last_run_at")?,
        created_at: row.get("created_at")?,
    })
}

/// Enabled schedules whose source is enabled too.
pub fn find_all_enabled(conn: &Connection) -> anyhow::Result<Vec<Schedule>> {
    let mut stmt = conn.prepare(
        "SELECT sc.* FROM schedules sc JOIN sources s ON s.id = sc.source_id
         WHERE sc.enabled = 1 AND s.enabled = 1
         ORDER BY sc.created_at",
    )?;
    let rows = stmt.query_map([], row_to_schedule)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<Schedule>> {
    let mut stmt = conn.prepare("SELECT * FROM schedules WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_schedule)?;
    Ok(rows.next().transpose()?)
}

pub fn create(conn: &Connection, source_id: &str, cron_expression: &str) -> anyhow::Result<Schedule> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO schedules (id, source_id, cron_expression, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id, source_id, cron_expression, now],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created schedule"))
}

/// Whether the schedule and its source are both still enabled.
pub fn is_active(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM schedules sc JOIN sources s ON s.id = sc.source_id
         WHERE sc.id = ? AND sc.enabled = 1 AND s.enabled = 1",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn touch_last_run(conn: &Connection, id: &str) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute("UPDATE schedules SET last_run_at = ? WHERE id = ?", params![now, id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::memory_pool;
    use crate::db::migrate::migrate;

    #[test]
    fn test_disabled_sources_are_not_scheduled() {
        let pool = memory_pool();
        migrate(&pool).unwrap();
        let conn = pool.get().unwrap();
        conn.execute_batch(
            "INSERT INTO sources (id, project_id, name, engine, database_name) VALUES ('on', 'p', 'a', 'sqlite', 'a.db');
             INSERT INTO sources (id, project_id, name, engine, database_name, enabled) VALUES ('off', 'p', 'b', 'sqlite', 'b.db', 0);",
        )
        .unwrap();

        let active = create(&conn, "on", "0 0 3 * * *").unwrap();
        create(&conn, "off", "0 0 4 * * *").unwrap();

        let enabled = find_all_enabled(&conn).unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, active.id);

        assert!(is_active(&conn, &active.id).unwrap());
        conn.execute("UPDATE sources SET enabled = 0 WHERE id = 'on'", []).unwrap();
        assert!(!is_active(&conn, &active.id).unwrap());
        assert!(!is_active(&conn, "missing").unwrap());

        touch_last_run(&conn, &active.id).unwrap();
        assert!(find_by_id(&conn, &active.id).unwrap().unwrap().last_run_at.is_some());
    }
}
