//! Durable blob storage for snapshots and diff results.
//!
//! Keys are caller-chosen opaque strings such as
//! `snapshots/{project}/{snapshot}.jsonl.gz` or `diffs/{a}-{b}.json`.
//!
//! Implementations:
//! - `LocalDiskStorage`: files under a root directory
//! - `MemoryStorage`: for unit tests
//! - `S3Storage`: S3-compatible object storage (feature `s3`)

pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

use crate::transfer::{ByteStream, Compression};
use crate::utils::errors::{Result, SnapError};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

pub use local::LocalDiskStorage;
pub use memory::MemoryStorage;
#[cfg(feature = "s3")]
pub use s3::{S3Settings, S3Storage};

/// Where an upload landed and how many bytes were stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub path: String,
    pub size: u64,
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Streams `body` to `key`, replacing any existing object.
    ///
    /// An error from `body` aborts the upload.
    async fn upload(&self, key: &str, body: ByteStream) -> Result<UploadResult>;

    /// Opens `key` for streaming. Missing keys are [`SnapError::NotFound`].
    async fn download(&self, key: &str) -> Result<ByteStream>;

    /// Removes `key`; removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Time-limited URL a client can fetch `key` from directly.
    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String>;
}

/// `snapshots/{project}/{snapshot}.jsonl[.gz|.zst]`
pub fn snapshot_key(project_id: &str, snapshot_id: &str, compression: Compression) -> String {
    format!(
        "snapshots/{}/{}.jsonl{}",
        flatten(project_id),
        flatten(snapshot_id),
        compression.extension()
    )
}

/// `diffs/{a}-{b}.json`, with path separators in the inputs flattened.
pub fn diff_key(key_a: &str, key_b: &str) -> String {
    format!("diffs/{}-{}.json", flatten(key_a), flatten(key_b))
}

fn flatten(component: &str) -> String {
    component.replace(['/', '\\'], "_")
}

/// Rejects keys that are empty, absolute or climb out of the storage root.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.starts_with('\\')
        || key.contains('\0')
        || key.split(['/', '\\']).any(|part| part == ".." || part.is_empty());
    if invalid {
        return Err(SnapError::InvalidKey(key.to_string()));
    }
    Ok(())
}
