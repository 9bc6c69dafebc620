//! S3-compatible object storage.
//!
//! Works against AWS S3 and S3-compatible services (MinIO, LocalStack).
//! Credentials come from the standard `AWS_*` environment variables.

use super::{validate_key, StorageAdapter, UploadResult};
use crate::transfer::ByteStream;
use crate::utils::errors::{Result, SnapError};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{ObjectStore, WriteMultipart};
use std::sync::Arc;
use std::time::Duration;

/// Parts uploaded concurrently during a multipart upload.
const MAX_IN_FLIGHT_PARTS: usize = 4;

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services.
    pub endpoint: Option<String>,
    /// Prepended to every key, without trailing slash.
    pub prefix: String,
}

#[derive(Clone)]
pub struct S3Storage {
    store: Arc<AmazonS3>,
    prefix: String,
}

impl S3Storage {
    pub fn new(settings: S3Settings) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&settings.bucket);
        if let Some(region) = &settings.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &settings.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder
            .build()
            .map_err(|e| SnapError::Storage(format!("Failed to create S3 store: {}", e)))?;

        Ok(Self {
            store: Arc::new(store),
            prefix: settings.prefix.trim_matches('/').to_string(),
        })
    }

    fn full_path(&self, key: &str) -> Result<ObjectPath> {
        validate_key(key)?;
        Ok(if self.prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, key))
        })
    }
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage").field("prefix", &self.prefix).finish()
    }
}

fn map_error(key: &str, err: object_store::Error) -> SnapError {
    match err {
        object_store::Error::NotFound { .. } => SnapError::NotFound(key.to_string()),
        other => SnapError::Storage(other.to_string()),
    }
}

#[async_trait]
impl StorageAdapter for S3Storage {
    async fn upload(&self, key: &str, mut body: ByteStream) -> Result<UploadResult> {
        let path = self.full_path(key)?;
        let upload = self
            .store
            .put_multipart(&path)
            .await
            .map_err(|e| map_error(key, e))?;
        let mut writer = WriteMultipart::new(upload);

        let mut size = 0u64;
        let streamed: Result<()> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                writer
                    .wait_for_capacity(MAX_IN_FLIGHT_PARTS)
                    .await
                    .map_err(|e| map_error(key, e))?;
                writer.write(&chunk);
                size += chunk.len() as u64;
            }
            Ok(())
        }
        .await;

        if let Err(e) = streamed {
            if let Err(abort) = writer.abort().await {
                tracing::warn!(key = %key, error = %abort, "Failed to abort multipart upload");
            }
            return Err(e);
        }

        writer.finish().await.map_err(|e| map_error(key, e))?;
        tracing::debug!(key = %key, size, "Stored object in S3");

        Ok(UploadResult {
            path: path.to_string(),
            size,
        })
    }

    async fn download(&self, key: &str) -> Result<ByteStream> {
        let path = self.full_path(key)?;
        let result = self.store.get(&path).await.map_err(|e| map_error(key, e))?;
        let owned_key = key.to_string();
        Ok(result
            .into_stream()
            .map_err(move |e| map_error(&owned_key, e).into_io())
            .boxed())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.full_path(key)?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_error(key, e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.full_path(key)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(map_error(key, e)),
        }
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String> {
        let path = self.full_path(key)?;
        let url = self
            .store
            .signed_url(http::Method::GET, &path, expires_in)
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(url.to_string())
    }
}
