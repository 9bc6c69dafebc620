//! SQLite loader. rusqlite is synchronous, so every statement runs on the
//! blocking pool against a shared connection handle.

use super::{destination_err, not_connected};
use crate::engine::ConnectionOptions;
use crate::extract::quote_ident;
use crate::format::RecordData;
use crate::restore::{Loader, RestoreMode};
use crate::utils::errors::{Result, SnapError};
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct SqliteLoader {
    conn: Option<Arc<Mutex<Connection>>>,
}

impl SqliteLoader {
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone().ok_or_else(not_connected)?;
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| SnapError::Destination("SQLite connection lock poisoned".to_string()))?;
            f(&guard).map_err(destination_err)
        })
        .await
        .map_err(destination_err)?
    }
}

#[async_trait]
impl Loader for SqliteLoader {
    async fn connect(&mut self, options: &ConnectionOptions) -> Result<()> {
        let path = options.database.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA foreign_keys = OFF; PRAGMA busy_timeout = 5000;")?;
            Ok::<_, rusqlite::Error>(conn)
        })
        .await
        .map_err(destination_err)?
        .map_err(destination_err)?;
        self.conn = Some(Arc::new(Mutex::new(conn)));
        Ok(())
    }

    async fn prepare_structure(&mut self, name: &str, mode: RestoreMode) -> Result<()> {
        if mode != RestoreMode::Overwrite {
            return Ok(());
        }
        let sql = format!("DELETE FROM {}", quote_ident(name, '"'));
        self.run(move |conn| conn.execute(&sql, [])).await?;
        tracing::debug!(table = %name, "Cleared destination table");
        Ok(())
    }

    async fn load_record(&mut self, name: &str, data: RecordData) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let sql = insert_sql(name, &data);
        let values: Vec<SqlValue> = data.into_iter().map(|(_, v)| json_to_sql(v)).collect();
        self.run(move |conn| conn.prepare_cached(&sql)?.execute(params_from_iter(values)))
            .await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        // Dropping the last handle closes the database.
        self.conn.take();
        Ok(())
    }
}

fn insert_sql(table: &str, data: &RecordData) -> String {
    let columns: Vec<String> = data.keys().map(|c| quote_ident(c, '"')).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table, '"'),
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn json_to_sql(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s),
        nested => SqlValue::Text(nested.to_string()),
    }
}
