//! MySQL loader: column-list inserts with one typed bind per field.

use super::{destination_err, not_connected};
use crate::engine::{ConnectionOptions, Engine};
use crate::extract::quote_ident;
use crate::format::RecordData;
use crate::restore::{Loader, RestoreMode};
use crate::utils::errors::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnection};
use sqlx::query::Query;
use sqlx::Connection;

#[derive(Default)]
pub struct MysqlLoader {
    conn: Option<MySqlConnection>,
}

#[async_trait]
impl Loader for MysqlLoader {
    async fn connect(&mut self, options: &ConnectionOptions) -> Result<()> {
        let conn = MySqlConnection::connect(&options.url(Engine::Mysql))
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
        // DELETE rather than TRUNCATE: TRUNCATE fails on tables referenced by foreign keys.
        sqlx::query(&format!("DELETE FROM {}", quote_ident(name, '`')))
            .execute(conn)
            .await
            .map_err(destination_err)?;
        tracing::debug!(table = %name, "Cleared destination table");
        Ok(())
    }

    async fn load_record(&mut self, name: &str, data: RecordData) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let conn = self.conn.as_mut().ok_or_else(not_connected)?;
        let sql = insert_sql(name, &data);
        let mut query = sqlx::query(&sql);
        for value in data.into_iter().map(|(_, v)| v) {
            query = bind_value(query, value);
        }
        query.execute(conn).await.map_err(destination_err)?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await.map_err(destination_err)?;
        }
        Ok(())
    }
}

fn insert_sql(table: &str, data: &RecordData) -> String {
    let columns: Vec<String> = data.keys().map(|c| quote_ident(c, '`')).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table, '`'),
        columns.join(", "),
        placeholders
    )
}

/// Binds a JSON value with the closest MySQL type. Nested values are bound
/// as JSON text.
fn bind_value(query: Query<'_, MySql, MySqlArguments>, value: Value) -> Query<'_, MySql, MySqlArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(u) = n.as_u64() {
                query.bind(u)
            } else {
                query.bind(n.as_f64())
            }
        }
        Value::String(s) => query.bind(s),
        nested @ (Value::Array(_) | Value::Object(_)) => query.bind(nested.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_sql() {
        let data = match json!({"id": 1, "name": "x", "tags": ["a"]}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert_eq!(
            insert_sql("order`s", &data),
            "INSERT INTO `order``s` (`id`, `name`, `tags`) VALUES (?, ?, ?)"
        );
    }
}
