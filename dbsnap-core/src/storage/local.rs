//! Local-disk storage rooted at a directory.

use super::{validate_key, StorageAdapter, UploadResult};
use crate::transfer::ByteStream;
use crate::utils::errors::{Result, SnapError};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

pub struct LocalDiskStorage {
    root: PathBuf,
    /// When set, signed URLs point at this base (e.g. a static file server)
    /// instead of `file://` paths.
    public_base_url: Option<String>,
}

impl LocalDiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base_url: None,
        }
    }

    pub fn with_public_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.public_base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl StorageAdapter for LocalDiskStorage {
    async fn upload(&self, key: &str, mut body: ByteStream) -> Result<UploadResult> {
        let dest_path = self.path_for(key)?;
        let parent = dest_path
            .parent()
            .ok_or_else(|| SnapError::InvalidKey(key.to_string()))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        // Stream into a sibling temp file and rename, so readers never see a
        // half-written object at `key`.
        let file_name = dest_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp_path = parent.join(format!(".{}.{}.part", file_name, uuid::Uuid::new_v4()));

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut size = 0u64;
        let written: Result<()> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                size += chunk.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(e) = written {
            if let Err(rm) = tokio::fs::remove_file(&tmp_path).await {
                tracing::warn!(path = %tmp_path.display(), error = %rm, "Failed to remove temp file");
            }
            return Err(e);
        }

        tokio::fs::rename(&tmp_path, &dest_path).await?;
        tracing::debug!(key = %key, size, "Stored object on local disk");

        Ok(UploadResult {
            path: dest_path.to_string_lossy().to_string(),
            size,
        })
    }

    async fn download(&self, key: &str) -> Result<ByteStream> {
        let path = self.path_for(key)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(ReaderStream::new(file).boxed()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SnapError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String> {
        if !self.exists(key).await? {
            return Err(SnapError::NotFound(key.to_string()));
        }
        match &self.public_base_url {
            Some(base) => {
                let expires = chrono::Utc::now().timestamp() + expires_in.as_secs() as i64;
                Ok(format!("{}/{}?expires={}", base, key, expires))
            }
            None => {
                let path = self.path_for(key)?;
                let absolute = std::path::absolute(&path).unwrap_or(path);
                Ok(format!("file://{}", absolute.display()))
            }
        }
    }
}
