//! PostgreSQL loader. Each row is inserted through `json_populate_record`,
//! so the server coerces JSON values to the destination column types.

use super::{destination_err, not_connected};
use crate::engine::{ConnectionOptions, Engine};
use crate::extract::quote_ident;
use crate::format::RecordData;
use crate::restore::{Loader, RestoreMode};
use crate::utils::errors::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgConnection;
use sqlx::Connection;

#[derive(Default)]
pub struct PostgresLoader {
    conn: Option<PgConnection>,
}

#[async_trait]
impl Loader for PostgresLoader {
    async fn connect(&mut self, options: &ConnectionOptions) -> Result<()> {
        let conn = PgConnection::connect(&options.url(Engine::Postgres))
            .await
            .map_err(destination_err)?;
        self.conn = Some(conn);
        Ok(())
    }

    async fn prepare_structure(&mut self, name: &str, mode: RestoreMode) -> Result<()> {
        if mode != RestoreMode::Overwrite {
            return Ok(());
        }
        let conn = self.conn.as_mut().ok_or_else(not_connected)?;
        sqlx::query(&format!("TRUNCATE TABLE {} CASCADE", quote_ident(name, '"')))
            .execute(conn)
            .await
            .map_err(destination_err)?;
        tracing::debug!(table = %name, "Truncated destination table");
        Ok(())
    }

    async fn load_record(&mut self, name: &str, data: RecordData) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let conn = self.conn.as_mut().ok_or_else(not_connected)?;
        let sql = insert_sql(name, &data);
        sqlx::query(&sql)
            .bind(Value::Object(data).to_string())
            .execute(conn)
            .await
            .map_err(destination_err)?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await.map_err(destination_err)?;
        }
        Ok(())
    }
}

/// Inserts only the columns present in the record so omitted columns keep
/// their defaults.
fn insert_sql(table: &str, data: &RecordData) -> String {
    let table = quote_ident(table, '"');
    let columns = data
        .keys()
        .map(|c| quote_ident(c, '"'))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} ({columns}) SELECT {columns} FROM json_populate_record(NULL::{table}, $1::json)"
    )
}
