//! Snapshot pipeline: extract, optionally compress, hash, upload.

use crate::engine::{ConnectionOptions, Engine};
use crate::extract::Extractor;
use crate::storage::StorageAdapter;
use crate::transfer::progress::{format_bytes, format_duration, format_rate};
use crate::transfer::{compress, Compression, HashingStream};
use crate::utils::errors::{Result, SnapError};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SnapshotOptions {
    #[serde(default)]
    pub compression: Compression,
}

/// A stored snapshot, as recorded in the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotArtifact {
    pub key: String,
    /// Stored bytes (after compression).
    pub size: u64,
    /// Hex MD5 of the stored bytes.
    pub checksum: String,
    pub engine: Engine,
    pub structures: Vec<String>,
    pub compression: Compression,
}

/// Streams one extraction into storage under `key`.
///
/// Nothing is buffered beyond the extractor channel and codec windows. A
/// failed extraction returns its own error and leaves no object at `key`.
pub async fn run_snapshot(
    extractor: &dyn Extractor,
    connection: &ConnectionOptions,
    storage: &dyn StorageAdapter,
    key: &str,
    options: SnapshotOptions,
) -> Result<SnapshotArtifact> {
    let started = Instant::now();
    let extraction = extractor.extract(connection).await?;
    let metadata = extraction.metadata;

    let encoded = compress(extraction.stream, options.compression);
    let (hashed, digest) = HashingStream::new(encoded);
    // A failed extraction reaches the adapter as an io error on the body.
    let uploaded = storage
        .upload(key, hashed.boxed())
        .await
        .map_err(SnapError::recovered)?;

    let checksum = digest
        .digest()
        .ok_or_else(|| SnapError::Storage(format!("upload of {} finished before the stream ended", key)))?;

    let elapsed = started.elapsed();
    tracing::info!(
        key = %key,
        engine = %metadata.engine,
        structures = metadata.structures.len(),
        size = %format_bytes(uploaded.size),
        elapsed = %format_duration(elapsed),
        rate = %format_rate(uploaded.size, elapsed),
        checksum = %checksum,
        "Snapshot stored"
    );

    Ok(SnapshotArtifact {
        key: key.to_string(),
        size: uploaded.size,
        checksum,
        engine: metadata.engine,
        structures: metadata.structures,
        compression: options.compression,
    })
}
