//! PostgreSQL extractor: base tables of the `public` schema, with indexes and
//! foreign keys.

use super::{finish, header_record, quote_ident, Extraction, ExtractionMetadata, Extractor};
use crate::engine::{ConnectionOptions, Engine};
use crate::format::{Record, RecordData, RecordSink, SchemaObject, StructureSchema};
use crate::utils::errors::{Result, SnapError};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde_json::Value;
use sqlx::postgres::PgConnection;
use sqlx::Connection;

const LIST_TABLES: &str = "SELECT table_name::text FROM information_schema.tables \
     WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
     ORDER BY table_name";

const LIST_INDEXES: &str = "SELECT indexname::text, indexdef FROM pg_indexes \
     WHERE schemaname = 'public' AND tablename = $1 \
     ORDER BY indexname";

const LIST_FOREIGN_KEYS: &str = "SELECT c.conname::text, pg_get_constraintdef(c.oid) \
     FROM pg_constraint c \
     JOIN pg_class t ON t.oid = c.conrelid \
     JOIN pg_namespace n ON n.oid = t.relnamespace \
     WHERE n.nspname = 'public' AND t.relname = $1 AND c.contype = 'f' \
     ORDER BY c.conname";

pub struct PostgresExtractor;

#[async_trait]
impl Extractor for PostgresExtractor {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    async fn extract(&self, options: &ConnectionOptions) -> Result<Extraction> {
        let mut conn = PgConnection::connect(&options.url(Engine::Postgres))
            .await
            .map_err(|e| SnapError::SourceConnection(e.to_string()))?;

        let tables: Vec<String> = match sqlx::query_scalar(LIST_TABLES).fetch_all(&mut conn).await {
            Ok(tables) => tables,
            Err(e) => {
                let _ = conn.close().await;
                return Err(SnapError::SourceConnection(e.to_string()));
            }
        };
        tracing::info!(database = %options.database, tables = tables.len(), "Starting PostgreSQL extraction");

        let (sink, stream) = RecordSink::channel();
        let structures = tables.clone();

        tokio::spawn(async move {
            let mut records = 0u64;
            let result = stream_tables(&mut conn, &tables, &sink, &mut records).await;
            if let Err(e) = conn.close().await {
                tracing::warn!(error = %e, "Failed to close PostgreSQL connection");
            }
            finish(Engine::Postgres, &sink, records, result).await;
        });

        Ok(Extraction {
            stream,
            metadata: ExtractionMetadata {
                engine: Engine::Postgres,
                structures,
            },
        })
    }
}

async fn stream_tables(
    conn: &mut PgConnection,
    tables: &[String],
    sink: &RecordSink,
    records: &mut u64,
) -> Result<()> {
    sink.emit(&header_record(Engine::Postgres, tables)).await?;

    for table in tables {
        let schema = table_schema(conn, table).await?;
        sink.emit(&Record::StructureStart {
            name: table.clone(),
            schema,
        })
        .await?;

        let sql = format!("SELECT row_to_json(t)::text FROM {} AS t", quote_ident(table, '"'));
        let mut rows = sqlx::query_scalar::<_, String>(&sql).fetch(&mut *conn);
        let mut count = 0u64;
        while let Some(text) = rows.try_next().await.map_err(source_err)? {
            let data: RecordData = serde_json::from_str(&text)?;
            sink.emit(&Record::Row {
                table: table.clone(),
                data,
            })
            .await?;
            count += 1;
        }
        drop(rows);

        sink.emit(&Record::StructureEnd { name: table.clone() }).await?;
        *records += count;
        tracing::debug!(table = %table, rows = count, "Table extracted");
    }

    Ok(())
}

async fn table_schema(conn: &mut PgConnection, table: &str) -> Result<StructureSchema> {
    let indexes: Vec<(String, String)> = sqlx::query_as(LIST_INDEXES)
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
            .map(|(name, def)| SchemaObject::new(name, Value::String(def)))
            .collect(),
        constraints: constraints
            .into_iter()
            .map(|(name, def)| SchemaObject::new(name, Value::String(def)))
            .collect(),
    })
}

fn source_err(e: sqlx::Error) -> SnapError {
    SnapError::Source(e.to_string())
}
