use crate::config::{StorageBackend, WorkerConfig};
use crate::db::connection::DbPool;
use crate::services::queue::LocalQueue;
use dbsnap_core::scaling::{ConcurrencyController, ScalingPolicy};
use dbsnap_core::storage::{LocalDiskStorage, StorageAdapter};
use std::sync::Arc;

pub struct AppState {
    pub db: DbPool,
    pub config: WorkerConfig,
    pub storage: Arc<dyn StorageAdapter>,
    pub controller: Arc<ConcurrencyController>,
    pub queue: Arc<LocalQueue>,
}

impl AppState {
    pub fn new(db: DbPool, config: WorkerConfig) -> anyhow::Result<Self> {
        let storage = build_storage(&config.storage)?;
        Ok(Self::with_storage(db, config, storage))
    }

    pub fn with_storage(db: DbPool, config: WorkerConfig, storage: Arc<dyn StorageAdapter>) -> Self {
        let controller = Arc::new(ConcurrencyController::new(ScalingPolicy {
            interval: config.scale_interval,
            ..ScalingPolicy::default()
        }));
        let queue = Arc::new(LocalQueue::new(controller.clone()));
        Self {
            db,
            config,
            storage,
            controller,
            queue,
        }
    }
}

pub fn build_storage(backend: &StorageBackend) -> anyhow::Result<Arc<dyn StorageAdapter>> {
    match backend {
        StorageBackend::Local { root, public_base_url } => {
            std::fs::create_dir_all(root)?;
            let mut storage = LocalDiskStorage::new(root.clone());
            if let Some(url) = public_base_url {
                storage = storage.with_public_base_url(url.clone());
            }
            tracing::info!(root = %root.display(), "Using local disk storage");
            Ok(Arc::new(storage))
        }
        #[cfg(feature = "s3")]
        StorageBackend::S3 {
            bucket,
            region,
            endpoint,
            prefix,
        } => {
            let storage = dbsnap_core::storage::S3Storage::new(dbsnap_core::storage::S3Settings {
                bucket: bucket.clone(),
                region: region.clone(),
                endpoint: endpoint.clone(),
                prefix: prefix.clone(),
            })?;
            tracing::info!(bucket = %bucket, "Using S3 storage");
            Ok(Arc::new(storage))
        }
        #[cfg(not(feature = "s3"))]
        StorageBackend::S3 { .. } => {
            anyhow::bail!("S3 storage requested but dbsnap-worker was built without the `s3` feature")
        }
    }
}

#[cfg(test)]
pub(crate) fn test_state(storage: Arc<dyn StorageAdapter>) -> Arc<AppState> {
    let pool = crate::db::connection::memory_pool();
    crate::db::migrate::migrate(&pool).expect("migrate");
    let config = WorkerConfig::from_lookup(|_| None).expect("default config");
    Arc::new(AppState::with_storage(pool, config, storage))
}
