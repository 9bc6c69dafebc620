//! Utility modules shared by the engines.

pub mod errors;
pub mod logger;

pub use errors::{Result, SnapError};
