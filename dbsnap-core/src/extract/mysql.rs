//! MySQL extractor. Rows are rendered server-side with `JSON_OBJECT` over the
//! table's ordered column list.

use super::{finish, header_record, quote_ident, Extraction, ExtractionMetadata, Extractor};
use crate::engine::{ConnectionOptions, Engine};
use crate::format::{Record, RecordData, RecordSink, SchemaObject, StructureSchema};
use crate::utils::errors::{Result, SnapError};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde_json::json;
use sqlx::mysql::MySqlConnection;
use sqlx::Connection;

// information_schema columns are binary-collated on some servers; the casts
// keep them decodable as text.
const LIST_TABLES: &str = "SELECT CAST(TABLE_NAME AS CHAR) FROM information_schema.TABLES \
     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' \
     ORDER BY TABLE_NAME";

const LIST_COLUMNS: &str = "SELECT CAST(COLUMN_NAME AS CHAR) FROM information_schema.COLUMNS \
     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
     ORDER BY ORDINAL_POSITION";

const LIST_INDEXES: &str = "SELECT CAST(INDEX_NAME AS CHAR), \
     CAST(GROUP_CONCAT(COLUMN_NAME ORDER BY SEQ_IN_INDEX) AS CHAR), \
     CAST(MIN(NON_UNIQUE) AS SIGNED) \
     FROM information_schema.STATISTICS \
     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
     GROUP BY INDEX_NAME ORDER BY INDEX_NAME";

const LIST_FOREIGN_KEYS: &str = "SELECT CAST(CONSTRAINT_NAME AS CHAR), CAST(REFERENCED_TABLE_NAME AS CHAR) \
     FROM information_schema.REFERENTIAL_CONSTRAINTS \
     WHERE CONSTRAINT_SCHEMA = DATABASE() AND TABLE_NAME = ? \
     ORDER BY CONSTRAINT_NAME";

pub struct MysqlExtractor;

#[async_trait]
impl Extractor for MysqlExtractor {
    fn engine(&self) -> Engine {
        Engine::Mysql
    }

    async fn extract(&self, options: &ConnectionOptions) -> Result<Extraction> {
        let mut conn = MySqlConnection::connect(&options.url(Engine::Mysql))
            .await
            .map_err(|e| SnapError::SourceConnection(e.to_string()))?;

        let tables: Vec<String> = match sqlx::query_scalar(LIST_TABLES).fetch_all(&mut conn).await {
            Ok(tables) => tables,
            Err(e) => {
                let _ = conn.close().await;
                return Err(SnapError::SourceConnection(e.to_string()));
            }
        };
        tracing::info!(database = %options.database, tables = tables.len(), "Starting MySQL extraction");

        let (sink, stream) = RecordSink::channel();
        let structures = tables.clone();

        tokio::spawn(async move {
            let mut records = 0u64;
            let result = stream_tables(&mut conn, &tables, &sink, &mut records).await;
            if let Err(e) = conn.close().await {
                tracing::warn!(error = %e, "Failed to close MySQL connection");
            }
            finish(Engine::Mysql, &sink, records, result).await;
        });

        Ok(Extraction {
            stream,
            metadata: ExtractionMetadata {
                engine: Engine::Mysql,
                structures,
            },
        })
    }
}

async fn stream_tables(
    conn: &mut MySqlConnection,
    tables: &[String],
    sink: &RecordSink,
    records: &mut u64,
) -> Result<()> {
    sink.emit(&header_record(Engine::Mysql, tables)).await?;

    for table in tables {
        let schema = table_schema(conn, table).await?;
        sink.emit(&Record::StructureStart {
            name: table.clone(),
            schema,
        })
        .await?;

        let columns: Vec<String> = sqlx::query_scalar(LIST_COLUMNS)
            .bind(table)
            .fetch_all(&mut *conn)
            .await
            .map_err(source_err)?;

        let mut count = 0u64;
        if !columns.is_empty() {
            let sql = row_query(table, &columns);
            let mut rows = sqlx::query_scalar::<_, String>(&sql).fetch(&mut *conn);
            while let Some(text) = rows.try_next().await.map_err(source_err)? {
                let data: RecordData = serde_json::from_str(&text)?;
                sink.emit(&Record::Row {
                    table: table.clone(),
                    data,
                })
                .await?;
                count += 1;
            }
        }

        sink.emit(&Record::StructureEnd { name: table.clone() }).await?;
        *records += count;
        tracing::debug!(table = %table, rows = count, "Table extracted");
    }

    Ok(())
}

/// `SELECT CAST(JSON_OBJECT('a', `a`, ...) AS CHAR) FROM `table``
fn row_query(table: &str, columns: &[String]) -> String {
    let pairs: Vec<String> = columns
        .iter()
        .map(|c| format!("{}, {}", string_literal(c), quote_ident(c, '`')))
        .collect();
    format!(
        "SELECT CAST(JSON_OBJECT({}) AS CHAR) FROM {}",
        pairs.join(", "),
        quote_ident(table, '`')
    )
}

fn string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

async fn table_schema(conn: &mut MySqlConnection, table: &str) -> Result<StructureSchema> {
    let indexes: Vec<(String, String, i64)> = sqlx::query_as(LIST_INDEXES)
        .bind(table)
        .fetch_all(&mut *conn)
        .await
        .map_err(source_err)?;

    let constraints: Vec<(String, String)> = sqlx::query_as(LIST_FOREIGN_KEYS)
        .bind(table)
        .fetch_all(&mut *conn)
        .await
        .map_err(source_err)?;

    Ok(StructureSchema {
        indexes: indexes
            .into_iter()
            .map(|(name, columns, non_unique)| {
                SchemaObject::new(name, json!({ "columns": columns, "unique": non_unique == 0 }))
            })
            .collect(),
        constraints: constraints
            .into_iter()
            .map(|(name, referenced)| {
                SchemaObject::new(name, json!({ "type": "FOREIGN KEY", "references": referenced }))
            })
            .collect(),
    })
}

fn source_err(e: sqlx::Error) -> SnapError {
    SnapError::Source(e.to_string())
}
