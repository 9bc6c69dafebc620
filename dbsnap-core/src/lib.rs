//! dbsnap core library
//!
//! Streams point-in-time captures of relational and document databases into a
//! canonical line-delimited format, compares captures record by record, and
//! replays them into target databases.

pub mod diff;
pub mod engine;
pub mod extract;
pub mod format;
pub mod jobs;
pub mod notify;
pub mod pipeline;
pub mod restore;
pub mod scaling;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use engine::{ConnectionOptions, Engine};
pub use utils::errors::SnapError;
pub type Result<T> = std::result::Result<T, SnapError>;
