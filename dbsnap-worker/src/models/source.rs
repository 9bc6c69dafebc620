use dbsnap_core::{ConnectionOptions, Engine};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use uuid::Uuid;

/// A database that is snapshotted. Credentials are stored as given; at-rest
/// encryption belongs to the deployment.
#[derive(Clone, Serialize)]
pub struct Source {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub engine: String,
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub database_name: String,
    pub max_snapshots: i64,
    pub enabled: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("engine", &self.engine)
            .field("connection", &self.connection_options())
            .finish()
    }
}

impl Source {
    pub fn engine(&self) -> anyhow::Result<Engine> {
        Ok(self.engine.parse()?)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            database: self.database_name.clone(),
        }
    }
}

fn row_to_source(row: &Row) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        name: row.get("name")?,
        engine: row.get("engine")?,
        host: row.get("host")?,
        port: row.get("port")?,
        username: row.get("username")?,
        password: row.get("password")?,
        database_name: row.get("database_name")?,
        max_snapshots: row.get("max_snapshots")?,
        enabled: row.get("enabled")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Source>> {
    let mut stmt = conn.prepare("SELECT * FROM sources ORDER BY name")?;
    let rows = stmt.query_map([], row_to_source)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<Source>> {
    let mut stmt = conn.prepare("SELECT * FROM sources WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_source)?;
    Ok(rows.next().transpose()?)
}

pub struct CreateSourceData {
    pub project_id: String,
    pub name: String,
    pub engine: Engine,
    pub connection: ConnectionOptions,
    pub max_snapshots: i64,
}

pub fn create(conn: &Connection, data: &CreateSourceData) -> anyhow::Result<Source> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO sources (id, project_id, name, engine, host, port, username, password, database_name, max_snapshots, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
        params![
            id,
            data.project_id,
            data.name,
            data.engine.as_str(),
            data.connection.host,
            data.connection.port,
            data.connection.username,
            data.connection.password,
            data.connection.database,
            data.max_snapshots,
            now
        ],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created source"))
}

pub fn set_enabled(conn: &Connection, id: &str, enabled: bool) -> anyhow::Result<bool> {
    let now = chrono::Utc::now().to_rfc3339();
    let changes = conn.execute(
        "UPDATE sources SET enabled = ?, updated_at = ? WHERE id = ?",
        params![enabled as i64, now, id],
    )?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::memory_pool;
    use crate::db::migrate::migrate;

    #[test]
    fn test_create_and_find() {
        let pool = memory_pool();
        migrate(&pool).unwrap();
        let conn = pool.get().unwrap();

        let source = create(
            &conn,
            &CreateSourceData {
                project_id: "proj".into(),
                name: "orders-db".into(),
                engine: Engine::Postgres,
                connection: ConnectionOptions {
                    host: "db.internal".into(),
                    port: Some(6432),
                    username: Some("app".into()),
                    password: Some("s3cret".into()),
                    database: "orders".into(),
                },
                max_snapshots: 3,
            },
        )
        .unwrap();

        assert_eq!(source.engine().unwrap(), Engine::Postgres);
        assert_eq!(source.connection_options().port, Some(6432));
        assert!(!format!("{:?}", source).contains("s3cret"));

        set_enabled(&conn, &source.id, false).unwrap();
        let found = find_by_id(&conn, &source.id).unwrap().unwrap();
        assert_eq!(found.enabled, 0);
        assert_eq!(find_all(&conn).unwrap().len(), 1);
        assert!(find_by_id(&conn, "missing").unwrap().is_none());
    }
}
