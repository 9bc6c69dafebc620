//! Extractors turn a live database into a canonical record stream.
//!
//! Each extractor connects and enumerates structures before returning, so a
//! source that cannot be reached fails the call itself. Records are then
//! produced by a spawned task into a bounded channel; the returned stream
//! pulls from it. The task always closes the source connection, and any read
//! error ends the stream with an `Err` item rather than a silent truncation.

pub mod mongo;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

use crate::engine::{ConnectionOptions, Engine};
use crate::format::{Header, Record, RecordSink};
use crate::transfer::ByteStream;
use crate::utils::errors::{Result, SnapError};
use async_trait::async_trait;
use serde::Serialize;

pub use mongo::MongoExtractor;
pub use mysql::MysqlExtractor;
pub use postgres::PostgresExtractor;
pub use sqlite::SqliteExtractor;

/// What an extraction covers, known before the first record is read.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionMetadata {
    pub engine: Engine,
    pub structures: Vec<String>,
}

/// A started extraction: the record stream plus its metadata.
pub struct Extraction {
    pub stream: ByteStream,
    pub metadata: ExtractionMetadata,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn engine(&self) -> Engine;

    async fn extract(&self, options: &ConnectionOptions) -> Result<Extraction>;
}

pub fn extractor_for(engine: Engine) -> Box<dyn Extractor> {
    match engine {
        Engine::Postgres => Box::new(PostgresExtractor),
        Engine::Mysql => Box::new(MysqlExtractor),
        Engine::Sqlite => Box::new(SqliteExtractor),
        Engine::Mongodb => Box::new(MongoExtractor),
    }
}

pub(crate) fn header_record(engine: Engine, structures: &[String]) -> Record {
    Record::Header(Header {
        engine: engine.as_str().to_string(),
        structures: structures.to_vec(),
        timestamp: chrono::Utc::now(),
    })
}

/// Quotes an identifier by wrapping it in `quote` and doubling embedded quotes.
pub(crate) fn quote_ident(name: &str, quote: char) -> String {
    let doubled: String = [quote, quote].iter().collect();
    format!("{q}{}{q}", name.replace(quote, &doubled), q = quote)
}

/// Logs how an extraction ended and forwards failures to the consumer.
pub(crate) async fn finish(engine: Engine, sink: &RecordSink, records: u64, result: Result<()>) {
    match result {
        Ok(()) => tracing::info!(engine = %engine, records, "Extraction complete"),
        Err(SnapError::Cancelled) => {
            tracing::warn!(engine = %engine, records, "Extraction abandoned: consumer closed the stream")
        }
        Err(e) => {
            tracing::error!(engine = %engine, records, error = %e, "Extraction failed");
            sink.fail(e).await;
        }
    }
}

pub(crate) fn finish_blocking(engine: Engine, sink: &RecordSink, records: u64, result: Result<()>) {
    match result {
        Ok(()) => tracing::info!(engine = %engine, records, "Extraction complete"),
        Err(SnapError::Cancelled) => {
            tracing::warn!(engine = %engine, records, "Extraction abandoned: consumer closed the stream")
        }
        Err(e) => {
            tracing::error!(engine = %engine, records, error = %e, "Extraction failed");
            sink.blocking_fail(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users", '"'), "\"users\"");
        assert_eq!(quote_ident("we\"ird", '"'), "\"we\"\"ird\"");
        assert_eq!(quote_ident("order`s", '`'), "`order``s`");
    }

    #[test]
    fn test_extractor_for_engine() {
        for engine in [Engine::Postgres, Engine::Mysql, Engine::Sqlite, Engine::Mongodb] {
            assert_eq!(extractor_for(engine).engine(), engine);
        }
    }
}
