//! Per-engine [`Loader`](super::Loader) implementations.

pub mod mongo;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

use super::Loader;
use crate::engine::Engine;
use crate::utils::errors::SnapError;

pub use mongo::MongoLoader;
pub use mysql::MysqlLoader;
pub use postgres::PostgresLoader;
pub use sqlite::SqliteLoader;

pub fn loader_for(engine: Engine) -> Box<dyn Loader> {
    match engine {
        Engine::Postgres => Box::new(PostgresLoader::default()),
        Engine::Mysql => Box::new(MysqlLoader::default()),
        Engine::Sqlite => Box::new(SqliteLoader::default()),
        Engine::Mongodb => Box::new(MongoLoader::default()),
    }
}

pub(crate) fn not_connected() -> SnapError {
    SnapError::Destination("loader is not connected".to_string())
}

pub(crate) fn destination_err(e: impl std::fmt::Display) -> SnapError {
    SnapError::Destination(e.to_string())
}
