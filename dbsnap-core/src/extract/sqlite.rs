//! SQLite extractor. rusqlite is synchronous, so connection setup and the
//! producer both run on the blocking pool and feed the channel with
//! blocking sends.

use super::{finish_blocking, header_record, quote_ident, Extraction, ExtractionMetadata, Extractor};
use crate::engine::{ConnectionOptions, Engine};
use crate::format::{Record, RecordData, RecordSink, SchemaObject, StructureSchema};
use crate::utils::errors::{Result, SnapError};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags};
use serde_json::{json, Value};
use std::collections::BTreeMap;

const LIST_TABLES: &str = "SELECT name FROM sqlite_master \
     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
     ORDER BY name";

const LIST_INDEXES: &str = "SELECT name, sql FROM sqlite_master \
     WHERE type = 'index' AND tbl_name = ?1 \
     ORDER BY name";

const LIST_FOREIGN_KEYS: &str = "SELECT id, \"table\", \"from\", \"to\", on_update, on_delete \
     FROM pragma_foreign_key_list(?1) \
     ORDER BY id, seq";

pub struct SqliteExtractor;

#[async_trait]
impl Extractor for SqliteExtractor {
    fn engine(&self) -> Engine {
        Engine::Sqlite
    }

    async fn extract(&self, options: &ConnectionOptions) -> Result<Extraction> {
        let path = options.database.clone();
        let (conn, tables) = tokio::task::spawn_blocking(move || -> Result<(Connection, Vec<String>)> {
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| SnapError::SourceConnection(format!("{}: {}", path, e)))?;
            let tables = list_tables(&conn).map_err(|e| SnapError::SourceConnection(e.to_string()))?;
            Ok((conn, tables))
        })
        .await
        .map_err(|e| SnapError::SourceConnection(e.to_string()))??;

        tracing::info!(database = %options.database, tables = tables.len(), "Starting SQLite extraction");

        let (sink, stream) = RecordSink::channel();
        let structures = tables.clone();

        tokio::task::spawn_blocking(move || {
            let mut records = 0u64;
            let result = stream_tables(&conn, &tables, &sink, &mut records);
            if let Err((_, e)) = conn.close() {
                tracing::warn!(error = %e, "Failed to close SQLite connection");
            }
            finish_blocking(Engine::Sqlite, &sink, records, result);
        });

        Ok(Extraction {
            stream,
            metadata: ExtractionMetadata {
                engine: Engine::Sqlite,
                structures,
            },
        })
    }
}

fn list_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(LIST_TABLES)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect()
}

fn stream_tables(conn: &Connection, tables: &[String], sink: &RecordSink, records: &mut u64) -> Result<()> {
    sink.blocking_emit(&header_record(Engine::Sqlite, tables))?;

    for table in tables {
        let schema = table_schema(conn, table).map_err(source_err)?;
        sink.blocking_emit(&Record::StructureStart {
            name: table.clone(),
            schema,
        })?;

        let mut stmt = conn
            .prepare(&format!("SELECT * FROM {}", quote_ident(table, '"')))
            .map_err(source_err)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query([]).map_err(source_err)?;

        let mut count = 0u64;
        while let Some(row) = rows.next().map_err(source_err)? {
            let mut data = RecordData::new();
            for (i, column) in columns.iter().enumerate() {
                let value = row.get_ref(i).map_err(source_err)?;
                data.insert(column.clone(), value_to_json(value));
            }
            sink.blocking_emit(&Record::Row {
                table: table.clone(),
                data,
            })?;
            count += 1;
        }

        sink.blocking_emit(&Record::StructureEnd { name: table.clone() })?;
        *records += count;
        tracing::debug!(table = %table, rows = count, "Table extracted");
    }

    Ok(())
}

fn table_schema(conn: &Connection, table: &str) -> rusqlite::Result<StructureSchema> {
    let mut stmt = conn.prepare(LIST_INDEXES)?;
    let indexes = stmt
        .query_map(params![table], |row| {
            let name: String = row.get(0)?;
            let sql: Option<String> = row.get(1)?;
            Ok(SchemaObject::new(name, sql.map(Value::String).unwrap_or(Value::Null)))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    // SQLite foreign keys are unnamed; group the per-column rows by id and
    // derive a stable name from the table and id.
    let mut grouped: BTreeMap<i64, (String, Vec<String>, Vec<Value>, String, String)> = BTreeMap::new();
    let mut stmt = conn.prepare(LIST_FOREIGN_KEYS)?;
    let mut rows = stmt.query(params![table])?;
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let referenced: String = row.get(1)?;
        let from: String = row.get(2)?;
        let to: Option<String> = row.get(3)?;
        let on_update: String = row.get(4)?;
        let on_delete: String = row.get(5)?;

        let entry = grouped
            .entry(id)
            .or_insert_with(|| (referenced, Vec::new(), Vec::new(), on_update, on_delete));
        entry.1.push(from);
        entry.2.push(to.map(Value::String).unwrap_or(Value::Null));
    }

    let constraints = grouped
        .into_iter()
        .map(|(id, (referenced, from, to, on_update, on_delete))| {
            SchemaObject::new(
                format!("fk_{}_{}", table, id),
                json!({
                    "columns": from,
                    "references": referenced,
                    "referencedColumns": to,
                    "onUpdate": on_update,
                    "onDelete": on_delete,
                }),
            )
        })
        .collect();

    Ok(StructureSchema { indexes, constraints })
}

/// Maps a SQLite storage class onto JSON. Blobs become lowercase hex.
fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

fn source_err(e: rusqlite::Error) -> SnapError {
    SnapError::Source(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_to_json() {
        assert_eq!(value_to_json(ValueRef::Null), Value::Null);
        assert_eq!(value_to_json(ValueRef::Integer(7)), json!(7));
        assert_eq!(value_to_json(ValueRef::Real(1.5)), json!(1.5));
        assert_eq!(value_to_json(ValueRef::Real(f64::NAN)), Value::Null);
        assert_eq!(value_to_json(ValueRef::Text(b"hi")), json!("hi"));
        assert_eq!(value_to_json(ValueRef::Blob(&[0xde, 0xad])), json!("dead"));
    }

    #[test]
    fn test_table_schema_reads_indexes_and_foreign_keys() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);
             CREATE UNIQUE INDEX ix_users_email ON users(email);
             CREATE TABLE orders (
               id INTEGER PRIMARY KEY,
               user_id INTEGER REFERENCES users(id) ON DELETE CASCADE
             );",
        )
        .unwrap();

        let users = table_schema(&conn, "users").unwrap();
        assert_eq!(users.index_names().collect::<Vec<_>>(), vec!["ix_users_email"]);
        assert!(users.constraints.is_empty());

        let orders = table_schema(&conn, "orders").unwrap();
        assert_eq!(orders.constraint_names().collect::<Vec<_>>(), vec!["fk_orders_0"]);
        assert_eq!(orders.constraints[0].definition["references"], json!("users"));
        assert_eq!(orders.constraints[0].definition["onDelete"], json!("CASCADE"));
    }
}
