//! In-memory storage for tests.

use super::{validate_key, StorageAdapter, UploadResult};
use crate::transfer::{bytes_stream, ByteStream};
use crate::utils::errors::{Result, SnapError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.read().await.get(key).cloned()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn upload(&self, key: &str, mut body: ByteStream) -> Result<UploadResult> {
        validate_key(key)?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        let size = buf.len() as u64;
        self.objects.write().await.insert(key.to_string(), buf.freeze());
        Ok(UploadResult {
            path: format!("memory://{}", key),
            size,
        })
    }

    async fn download(&self, key: &str) -> Result<ByteStream> {
        let data = self
            .get(key)
            .await
            .ok_or_else(|| SnapError::NotFound(key.to_string()))?;
        Ok(bytes_stream(data))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String> {
        if !self.exists(key).await? {
            return Err(SnapError::NotFound(key.to_string()));
        }
        Ok(format!("memory://{}?expires_in={}", key, expires_in.as_secs()))
    }
}
