//! Replays a stored snapshot into a target database.
//!
//! The engine owns streaming and filtering; per-engine writes go through a
//! [`Loader`]. A failed restore leaves the destination partially loaded.

pub mod loaders;

use crate::engine::{ConnectionOptions, Engine};
use crate::format::{open_records, Record, RecordData};
use crate::storage::StorageAdapter;
use crate::utils::errors::{Result, SnapError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

pub use loaders::loader_for;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreMode {
    /// Empty each restored structure before its first record.
    Overwrite,
    #[default]
    Append,
}

impl FromStr for RestoreMode {
    type Err = SnapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "overwrite" => Ok(RestoreMode::Overwrite),
            "append" => Ok(RestoreMode::Append),
            other => Err(SnapError::InvalidJob(format!("unknown restore mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// Structures to restore; empty restores everything.
    #[serde(default)]
    pub structures: Vec<String>,
    #[serde(default)]
    pub mode: RestoreMode,
}

impl RestoreOptions {
    fn includes(&self, structure: &str) -> bool {
        self.structures.is_empty() || self.structures.iter().any(|s| s == structure)
    }
}

/// Preview of a snapshot, computed without touching any database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub engine: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub structure_counts: BTreeMap<String, u64>,
    pub total_records: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub skipped_lines: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub structure_counts: BTreeMap<String, u64>,
    pub total_records: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub skipped_lines: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Writes records into one destination database.
///
/// A loader instance holds a single connection and is never shared between
/// concurrent restores.
#[async_trait]
pub trait Loader: Send {
    async fn connect(&mut self, options: &ConnectionOptions) -> Result<()>;

    /// Called once per structure, before its first record.
    async fn prepare_structure(&mut self, name: &str, mode: RestoreMode) -> Result<()>;

    async fn load_record(&mut self, name: &str, data: RecordData) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;
}

pub struct RestoreEngine {
    storage: Arc<dyn StorageAdapter>,
}

impl RestoreEngine {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    pub async fn snapshot_summary(&self, key: &str) -> Result<RestoreSummary> {
        let mut reader = open_records(self.storage.download(key).await?).await?;

        let mut engine = None;
        let mut timestamp = None;
        let mut structure_counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut total_records = 0u64;

        while let Some(record) = reader.next_record().await? {
            match record {
                Record::Header(header) => {
                    engine = Some(header.engine);
                    timestamp = Some(header.timestamp);
                }
                Record::StructureStart { name, .. } => {
                    structure_counts.entry(name).or_insert(0);
                }
                other => {
                    if let Some(name) = other.structure_name() {
                        *structure_counts.entry(name.to_string()).or_insert(0) += 1;
                        total_records += 1;
                    }
                }
            }
        }

        Ok(RestoreSummary {
            engine: engine.unwrap_or_else(|| "Unknown".to_string()),
            timestamp,
            structure_counts,
            total_records,
            skipped_lines: reader.skipped_lines(),
        })
    }

    /// Restores `key` into a `target_engine` database.
    ///
    /// An unknown engine name fails before any connection is attempted.
    pub async fn apply_restore(
        &self,
        key: &str,
        target_engine: &str,
        connection: &ConnectionOptions,
        options: &RestoreOptions,
    ) -> Result<RestoreReport> {
        let engine = Engine::from_str(target_engine)?;
        let mut loader = loader_for(engine);
        self.apply_restore_with(key, loader.as_mut(), connection, options).await
    }

    /// Restores `key` through a caller-supplied loader.
    pub async fn apply_restore_with(
        &self,
        key: &str,
        loader: &mut dyn Loader,
        connection: &ConnectionOptions,
        options: &RestoreOptions,
    ) -> Result<RestoreReport> {
        let stream = self.storage.download(key).await?;
        let mut reader = open_records(stream).await?;

        loader.connect(connection).await?;
        tracing::info!(key = %key, mode = ?options.mode, "Starting restore");

        let mut report = RestoreReport::default();
        let loaded: Result<()> = async {
            let mut prepared: HashSet<String> = HashSet::new();
            while let Some(record) = reader.next_record().await? {
                let Some((name, data)) = record.into_data() else {
                    continue;
                };
                if !options.includes(&name) {
                    continue;
                }
                if !prepared.contains(&name) {
                    loader.prepare_structure(&name, options.mode).await?;
                    prepared.insert(name.clone());
                }
                loader.load_record(&name, data).await?;
                *report.structure_counts.entry(name).or_insert(0) += 1;
                report.total_records += 1;
            }
            Ok(())
        }
        .await;
        report.skipped_lines = reader.skipped_lines();

        let disconnected = loader.disconnect().await;
        match (loaded, disconnected) {
            (Err(e), disconnect) => {
                if let Err(de) = disconnect {
                    tracing::warn!(error = %de, "Disconnect after failed restore also failed");
                }
                tracing::error!(key = %key, records = report.total_records, error = %e, "Restore failed");
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => {
                tracing::info!(
                    key = %key,
                    structures = report.structure_counts.len(),
                    records = report.total_records,
                    "Restore complete"
                );
                Ok(report)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::transfer::bytes_stream;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Connect,
        Prepare(String, RestoreMode),
        Load(String),
        Disconnect,
    }

    #[derive(Default)]
    struct RecordingLoader {
        calls: Vec<Call>,
        fail_on_load: Option<String>,
    }

    #[async_trait]
    impl Loader for RecordingLoader {
        async fn connect(&mut self, _options: &ConnectionOptions) -> Result<()> {
            self.calls.push(Call::Connect);
            Ok(())
        }

        async fn prepare_structure(&mut self, name: &str, mode: RestoreMode) -> Result<()> {
            self.calls.push(Call::Prepare(name.to_string(), mode));
            Ok(())
        }

        async fn load_record(&mut self, name: &str, _data: RecordData) -> Result<()> {
            if self.fail_on_load.as_deref() == Some(name) {
                return Err(SnapError::Destination("constraint violation".into()));
            }
            self.calls.push(Call::Load(name.to_string()));
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.calls.push(Call::Disconnect);
            Ok(())
        }
    }

    const SNAPSHOT: &str = concat!(
        r#"{"type":"header","engine":"postgres","structures":["users","orders"],"timestamp":"2024-03-01T12:00:00Z"}"#, "\n",
        r#"{"type":"structure_start","name":"users","schema":{}}"#, "\n",
        r#"{"type":"row","table":"users","data":{"id":1}}"#, "\n",
        r#"{"type":"row","table":"users","data":{"id":2}}"#, "\n",
        r#"{"type":"structure_end","name":"users"}"#, "\n",
        r#"{"type":"structure_start","name":"orders","schema":{}}"#, "\n",
        r#"{"type":"row","table":"orders","data":{"id":10}}"#, "\n",
        r#"{"type":"structure_end","name":"orders"}"#, "\n",
        r#"{"type":"row","table":"users","data":{"id":3}}"#, "\n",
    );

    async fn engine_with(key: &str, body: &'static str) -> RestoreEngine {
        let storage = Arc::new(MemoryStorage::new());
        storage.upload(key, bytes_stream(body)).await.unwrap();
        RestoreEngine::new(storage)
    }

    #[tokio::test]
    async fn test_restore_only_listed_structures() {
        let engine = engine_with("snapshots/p/s.jsonl", SNAPSHOT).await;
        let mut loader = RecordingLoader::default();
        let options = RestoreOptions {
            structures: vec!["users".into()],
            mode: RestoreMode::Overwrite,
        };

        let report = engine
            .apply_restore_with("snapshots/p/s.jsonl", &mut loader, &ConnectionOptions::default(), &options)
            .await
            .unwrap();

        assert_eq!(report.total_records, 3);
        assert_eq!(report.structure_counts.get("users"), Some(&3));
        assert!(!report.structure_counts.contains_key("orders"));
        assert!(loader.calls.iter().all(|c| match c {
            Call::Prepare(name, _) | Call::Load(name) => name == "users",
            _ => true,
        }));
        // Re-entering `users` after `orders` must not truncate it again.
        let prepares: Vec<_> = loader.calls.iter().filter(|c| matches!(c, Call::Prepare(..))).collect();
        assert_eq!(prepares, vec![&Call::Prepare("users".into(), RestoreMode::Overwrite)]);
        assert_eq!(loader.calls.first(), Some(&Call::Connect));
        assert_eq!(loader.calls.last(), Some(&Call::Disconnect));
    }

    #[tokio::test]
    async fn test_empty_allow_list_restores_everything() {
        let engine = engine_with("snapshots/p/s.jsonl", SNAPSHOT).await;
        let mut loader = RecordingLoader::default();
        let report = engine
            .apply_restore_with(
                "snapshots/p/s.jsonl",
                &mut loader,
                &ConnectionOptions::default(),
                &RestoreOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(report.total_records, 4);
        assert_eq!(report.structure_counts.get("orders"), Some(&1));
    }

    #[tokio::test]
    async fn test_disconnect_runs_on_load_failure() {
        let engine = engine_with("snapshots/p/s.jsonl", SNAPSHOT).await;
        let mut loader = RecordingLoader {
            fail_on_load: Some("orders".into()),
            ..Default::default()
        };
        let err = engine
            .apply_restore_with(
                "snapshots/p/s.jsonl",
                &mut loader,
                &ConnectionOptions::default(),
                &RestoreOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SnapError::Destination(_)));
        assert_eq!(loader.calls.last(), Some(&Call::Disconnect));
    }

    #[tokio::test]
    async fn test_unknown_engine_fails_before_connecting() {
        let engine = engine_with("snapshots/p/s.jsonl", SNAPSHOT).await;
        let err = engine
            .apply_restore(
                "snapshots/p/s.jsonl",
                "oracle",
                &ConnectionOptions::default(),
                &RestoreOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SnapError::UnsupportedEngine(name) if name == "oracle"));
    }

    #[tokio::test]
    async fn test_missing_snapshot_never_connects() {
        let engine = RestoreEngine::new(Arc::new(MemoryStorage::new()));
        let mut loader = RecordingLoader::default();
        let err = engine
            .apply_restore_with("snapshots/none", &mut loader, &ConnectionOptions::default(), &RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SnapError::NotFound(_)));
        assert!(loader.calls.is_empty());
    }

    #[tokio::test]
    async fn test_summary_counts_per_structure() {
        let engine = engine_with("snapshots/p/s.jsonl", SNAPSHOT).await;
        let summary = engine.snapshot_summary("snapshots/p/s.jsonl").await.unwrap();
        assert_eq!(summary.engine, "postgres");
        assert!(summary.timestamp.is_some());
        assert_eq!(summary.structure_counts.get("users"), Some(&3));
        assert_eq!(summary.structure_counts.get("orders"), Some(&1));
        assert_eq!(summary.total_records, 4);
    }

    #[tokio::test]
    async fn test_summary_of_empty_snapshot() {
        let engine = engine_with("snapshots/p/empty.jsonl", "").await;
        let summary = engine.snapshot_summary("snapshots/p/empty.jsonl").await.unwrap();
        assert_eq!(summary.engine, "Unknown");
        assert!(summary.timestamp.is_none());
        assert!(summary.structure_counts.is_empty());
        assert_eq!(summary.total_records, 0);
    }

    #[test]
    fn test_restore_mode_wire_names() {
        assert_eq!(serde_json::to_string(&RestoreMode::Overwrite).unwrap(), "\"OVERWRITE\"");
        assert_eq!("append".parse::<RestoreMode>().unwrap(), RestoreMode::Append);
        assert!(matches!("merge".parse::<RestoreMode>(), Err(SnapError::InvalidJob(msg)) if msg.contains("merge")));
    }
}
