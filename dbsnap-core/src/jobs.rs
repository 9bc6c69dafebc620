//! Job payloads, the queue seam and the processors the worker runs.
//!
//! Processors take their collaborators as arguments; nothing here reaches
//! for process-wide state. Retries belong to the queue, not the processors.

use crate::diff::{store_result, DiffEngine, DiffSummary, TableDiffSummary};
use crate::engine::{ConnectionOptions, Engine};
use crate::extract::extractor_for;
use crate::pipeline::{run_snapshot, SnapshotArtifact, SnapshotOptions};
use crate::restore::{RestoreEngine, RestoreMode, RestoreOptions, RestoreReport};
use crate::storage::{diff_key, snapshot_key, StorageAdapter};
use crate::transfer::Compression;
use crate::utils::errors::{Result, SnapError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const SNAPSHOT_QUEUE: &str = "snapshots";
pub const DIFF_QUEUE: &str = "diffs";
pub const RESTORE_QUEUE: &str = "restores";

pub const QUEUES: [&str; 3] = [SNAPSHOT_QUEUE, DIFF_QUEUE, RESTORE_QUEUE];

pub type JobId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotJob {
    pub snapshot_id: String,
    pub project_id: String,
    pub engine: Engine,
    pub connection: ConnectionOptions,
    #[serde(default)]
    pub compression: Compression,
}

/// A live database to diff a stored snapshot against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSource {
    pub engine: Engine,
    pub connection: ConnectionOptions,
}

/// Either `key_b` (stored against stored) or `live` (stored against live).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffJob {
    pub key_a: String,
    #[serde(default)]
    pub key_b: Option<String>,
    #[serde(default)]
    pub live: Option<LiveSource>,
    pub engine: Engine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreJob {
    pub key: String,
    /// Resolved when the job runs, so an unknown name fails the job.
    pub target_engine: String,
    pub connection: ConnectionOptions,
    #[serde(default)]
    pub structures: Vec<String>,
    #[serde(default)]
    pub mode: RestoreMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    pub attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub backoff: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

impl JobOptions {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1u32 << exp)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, payload: serde_json::Value, options: JobOptions) -> Result<JobId>;
}

#[async_trait]
pub trait QueueMetrics: Send + Sync {
    async fn counts(&self, queue: &str) -> Result<QueueCounts>;
}

/// Serializes `payload` and enqueues it on `queue`.
pub async fn enqueue_job<T: Serialize>(
    jobs: &dyn JobQueue,
    queue: &str,
    payload: &T,
    options: JobOptions,
) -> Result<JobId> {
    let payload = serde_json::to_value(payload)?;
    jobs.enqueue(queue, payload, options).await
}

pub async fn process_snapshot(storage: &dyn StorageAdapter, job: &SnapshotJob) -> Result<SnapshotArtifact> {
    let extractor = extractor_for(job.engine);
    let key = snapshot_key(&job.project_id, &job.snapshot_id, job.compression);
    run_snapshot(
        extractor.as_ref(),
        &job.connection,
        storage,
        &key,
        SnapshotOptions {
            compression: job.compression,
        },
    )
    .await
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffOutcome {
    pub result_key: String,
    pub summary: DiffSummary,
    pub tables: Vec<TableDiffSummary>,
}

pub async fn process_diff(storage: &dyn StorageAdapter, job: &DiffJob) -> Result<DiffOutcome> {
    let engine = DiffEngine::for_engine(job.engine);

    let (result, result_key) = match (&job.key_b, &job.live) {
        (Some(key_b), _) => {
            let result = engine.compare_snapshots(storage, &job.key_a, key_b).await?;
            (result, diff_key(&job.key_a, key_b))
        }
        (None, Some(live)) => {
            let extraction = extractor_for(live.engine).extract(&live.connection).await?;
            let result = engine.compare_live(storage, &job.key_a, extraction).await?;
            let live_label = format!("live-{}", result.timestamp.format("%Y%m%dT%H%M%S"));
            (result, diff_key(&job.key_a, &live_label))
        }
        (None, None) => {
            return Err(SnapError::InvalidJob(
                "diff job needs either keyB or a live source".to_string(),
            ))
        }
    };

    store_result(storage, &result_key, &result).await?;
    Ok(DiffOutcome {
        result_key,
        summary: result.summary,
        tables: result.tables,
    })
}

pub async fn process_restore(storage: Arc<dyn StorageAdapter>, job: &RestoreJob) -> Result<RestoreReport> {
    RestoreEngine::new(storage)
        .apply_restore(
            &job.key,
            &job.target_engine,
            &job.connection,
            &RestoreOptions {
                structures: job.structures.clone(),
                mode: job.mode,
            },
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::transfer::bytes_stream;
    use serde_json::json;

    #[test]
    fn test_backoff_doubles() {
        let options = JobOptions::default();
        assert_eq!(options.backoff_for(1), Duration::from_secs(5));
        assert_eq!(options.backoff_for(2), Duration::from_secs(10));
        assert_eq!(options.backoff_for(3), Duration::from_secs(20));
    }

    #[test]
    fn test_payload_wire_shape() {
        let job: RestoreJob = serde_json::from_value(json!({
            "key": "snapshots/p/s.jsonl.gz",
            "targetEngine": "postgresql",
            "connection": {"host": "db", "database": "app"},
            "structures": ["users"],
            "mode": "OVERWRITE"
        }))
        .unwrap();
        assert_eq!(job.mode, RestoreMode::Overwrite);
        assert_eq!(job.connection.port, None);

        let snapshot = SnapshotJob {
            snapshot_id: "s1".into(),
            project_id: "p1".into(),
            engine: Engine::Sqlite,
            connection: ConnectionOptions::default(),
            compression: Compression::Zstd,
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["snapshotId"], json!("s1"));
        assert_eq!(value["engine"], json!("sqlite"));
        assert_eq!(value["compression"], json!("zstd"));
    }

    #[tokio::test]
    async fn test_process_diff_stores_result() {
        let storage = MemoryStorage::new();
        storage
            .upload("snapshots/p/a.jsonl", bytes_stream(r#"{"type":"row","table":"t","data":{"id":1}}"#))
            .await
            .unwrap();
        storage
            .upload("snapshots/p/b.jsonl", bytes_stream(r#"{"type":"row","table":"t","data":{"id":2}}"#))
            .await
            .unwrap();

        let outcome = process_diff(
            &storage,
            &DiffJob {
                key_a: "snapshots/p/a.jsonl".into(),
                key_b: Some("snapshots/p/b.jsonl".into()),
                live: None,
                engine: Engine::Postgres,
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.result_key, "diffs/snapshots_p_a.jsonl-snapshots_p_b.jsonl.json");
        assert_eq!(outcome.summary.total_added, 1);
        assert_eq!(outcome.summary.total_removed, 1);
        assert!(storage.exists(&outcome.result_key).await.unwrap());
    }

    #[tokio::test]
    async fn test_process_diff_without_second_side() {
        let storage = MemoryStorage::new();
        let err = process_diff(
            &storage,
            &DiffJob {
                key_a: "snapshots/p/a.jsonl".into(),
                key_b: None,
                live: None,
                engine: Engine::Mongodb,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SnapError::InvalidJob(_)));
    }
}
