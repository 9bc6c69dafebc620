use dbsnap_core::transfer::Compression;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum StorageBackend {
    Local {
        root: PathBuf,
        public_base_url: Option<String>,
    },
    S3 {
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
        prefix: String,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub storage: StorageBackend,
    pub compression: Compression,
    pub growth_alert_percent: f64,
    pub scale_interval: Duration,
    pub log_level: String,
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source; `from_env` passes the process environment.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let data_dir = PathBuf::from(var("DBSNAP_DATA_DIR").unwrap_or_else(|| "./data".into()));
        let db_path = var("DBSNAP_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("dbsnap.db"));

        let storage = match var("DBSNAP_STORAGE").as_deref().unwrap_or("local") {
            "local" => StorageBackend::Local {
                root: var("DBSNAP_STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| data_dir.join("artifacts")),
                public_base_url: var("DBSNAP_PUBLIC_BASE_URL"),
            },
            "s3" => StorageBackend::S3 {
                bucket: var("DBSNAP_S3_BUCKET")
                    .ok_or_else(|| anyhow::anyhow!("DBSNAP_S3_BUCKET is required when DBSNAP_STORAGE=s3"))?,
                region: var("DBSNAP_S3_REGION"),
                endpoint: var("DBSNAP_S3_ENDPOINT"),
                prefix: var("DBSNAP_S3_PREFIX").unwrap_or_default(),
            },
            other => anyhow::bail!("Unknown DBSNAP_STORAGE backend: {}", other),
        };

        let compression = match var("DBSNAP_COMPRESSION") {
            Some(v) => v.parse()?,
            None => Compression::Gzip,
        };

        Ok(Self {
            data_dir,
            db_path,
            storage,
            compression,
            growth_alert_percent: var("DBSNAP_GROWTH_ALERT_PERCENT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(50.0),
            scale_interval: Duration::from_secs(
                var("DBSNAP_SCALE_INTERVAL_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".into()),
        })
    }
}
