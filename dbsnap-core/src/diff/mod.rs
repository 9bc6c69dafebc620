//! Record-level comparison of two canonical streams.
//!
//! Both sides are indexed into `structure -> key -> data` maps, then joined
//! on key: present only in B is ADDED, only in A is REMOVED, in both with
//! different canonical content is MODIFIED. Record order within a stream
//! never matters. The whole key index of a structure is held in memory, which
//! bounds the size of structures that can be compared.

pub mod canonical;
pub mod strategy;

use crate::engine::Engine;
use crate::extract::Extraction;
use crate::format::{open_records, Record, RecordData, RecordReader, StructureSchema};
use crate::storage::{StorageAdapter, UploadResult};
use crate::transfer::bytes_stream;
use crate::utils::errors::Result;
use canonical::canonical_map;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strategy::{
    DocumentKeyer, DocumentSchemaComparer, RecordKey, RecordKeyer, RelationalKeyer,
    RelationalSchemaComparer, SchemaComparer,
};
use tokio::io::AsyncBufRead;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffDetail {
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub object_id: String,
    pub structure_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<RecordData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<RecordData>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaChanges {
    pub added_indexes: Vec<String>,
    pub removed_indexes: Vec<String>,
    pub added_constraints: Vec<String>,
    pub removed_constraints: Vec<String>,
}

impl SchemaChanges {
    pub fn is_empty(&self) -> bool {
        self.added_indexes.is_empty()
            && self.removed_indexes.is_empty()
            && self.added_constraints.is_empty()
            && self.removed_constraints.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDiffSummary {
    pub name: String,
    pub added: u64,
    pub removed: u64,
    pub modified: u64,
    pub schema_changes: SchemaChanges,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub total_added: u64,
    pub total_removed: u64,
    pub total_modified: u64,
}

/// Outcome of one comparison. Built once and never mutated afterwards.
///
/// `tables` and `details` are ordered by structure name, then record key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    pub snapshot_a: String,
    pub snapshot_b: String,
    pub timestamp: DateTime<Utc>,
    pub summary: DiffSummary,
    pub tables: Vec<TableDiffSummary>,
    pub details: Vec<DiffDetail>,
    /// Malformed lines skipped across both inputs.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub skipped_lines: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Everything one side of a comparison contributes.
#[derive(Debug, Default)]
pub struct StructureIndex {
    pub records: BTreeMap<String, BTreeMap<RecordKey, RecordData>>,
    /// Last `structure_start` schema seen per structure.
    pub schemas: BTreeMap<String, StructureSchema>,
    pub skipped_lines: u64,
}

pub struct DiffEngine {
    keyer: Box<dyn RecordKeyer>,
    schema: Box<dyn SchemaComparer>,
}

impl DiffEngine {
    pub fn new(keyer: Box<dyn RecordKeyer>, schema: Box<dyn SchemaComparer>) -> Self {
        Self { keyer, schema }
    }

    pub fn relational() -> Self {
        Self::new(Box::new(RelationalKeyer), Box::new(RelationalSchemaComparer))
    }

    pub fn document() -> Self {
        Self::new(Box::new(DocumentKeyer), Box::new(DocumentSchemaComparer))
    }

    pub fn for_engine(engine: Engine) -> Self {
        if engine.is_document() {
            Self::document()
        } else {
            Self::relational()
        }
    }

    /// Reads a whole stream into per-structure key maps.
    pub async fn index<R>(&self, reader: &mut RecordReader<R>) -> Result<StructureIndex>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut index = StructureIndex::default();
        while let Some(record) = reader.next_record().await? {
            match record {
                Record::StructureStart { name, schema } => {
                    index.schemas.insert(name, schema);
                }
                data_record @ (Record::Row { .. } | Record::Document { .. }) => {
                    if let Some((structure, data)) = data_record.into_data() {
                        let key = self.keyer.key(&data);
                        index.records.entry(structure).or_default().insert(key, data);
                    }
                }
                Record::Header(_) | Record::StructureEnd { .. } => {}
            }
        }
        index.skipped_lines = reader.skipped_lines();
        Ok(index)
    }

    /// Compares two record streams; `label_a`/`label_b` name the sides in the result.
    pub async fn compare<RA, RB>(
        &self,
        mut reader_a: RecordReader<RA>,
        label_a: &str,
        mut reader_b: RecordReader<RB>,
        label_b: &str,
    ) -> Result<DiffResult>
    where
        RA: AsyncBufRead + Unpin,
        RB: AsyncBufRead + Unpin,
    {
        let (index_a, index_b) = tokio::try_join!(self.index(&mut reader_a), self.index(&mut reader_b))?;
        Ok(self.diff_indexes(label_a, label_b, index_a, index_b))
    }

    /// Joins two indexes. Pure; consumes both sides.
    pub fn diff_indexes(
        &self,
        label_a: &str,
        label_b: &str,
        mut a: StructureIndex,
        mut b: StructureIndex,
    ) -> DiffResult {
        let structures: BTreeSet<String> = a
            .records
            .keys()
            .chain(b.records.keys())
            .chain(a.schemas.keys())
            .chain(b.schemas.keys())
            .cloned()
            .collect();

        let mut summary = DiffSummary::default();
        let mut tables = Vec::new();
        let mut details = Vec::new();

        for name in structures {
            let schema_changes = self.schema.compare(a.schemas.get(&name), b.schemas.get(&name));

            let mut rows_a = a.records.remove(&name).unwrap_or_default();
            let mut rows_b = b.records.remove(&name).unwrap_or_default();
            let keys: BTreeSet<RecordKey> = rows_a.keys().chain(rows_b.keys()).cloned().collect();

            let mut table = TableDiffSummary {
                name: name.clone(),
                added: 0,
                removed: 0,
                modified: 0,
                schema_changes,
            };

            for key in keys {
                let change = match (rows_a.remove(&key), rows_b.remove(&key)) {
                    (None, Some(after)) => {
                        table.added += 1;
                        Some((ChangeType::Added, None, Some(after)))
                    }
                    (Some(before), None) => {
                        table.removed += 1;
                        Some((ChangeType::Removed, Some(before), None))
                    }
                    (Some(before), Some(after)) if canonical_map(&before) != canonical_map(&after) => {
                        table.modified += 1;
                        Some((ChangeType::Modified, Some(before), Some(after)))
                    }
                    _ => None,
                };

                if let Some((change_type, before, after)) = change {
                    details.push(DiffDetail {
                        change_type,
                        object_id: key.into_display(),
                        structure_name: name.clone(),
                        before,
                        after,
                    });
                }
            }

            summary.total_added += table.added;
            summary.total_removed += table.removed;
            summary.total_modified += table.modified;

            let changed = table.added + table.removed + table.modified > 0 || !table.schema_changes.is_empty();
            if changed {
                tables.push(table);
            }
        }

        DiffResult {
            snapshot_a: label_a.to_string(),
            snapshot_b: label_b.to_string(),
            timestamp: Utc::now(),
            summary,
            tables,
            details,
            skipped_lines: a.skipped_lines + b.skipped_lines,
        }
    }

    /// Diffs two stored snapshots. A missing key fails the comparison.
    pub async fn compare_snapshots(
        &self,
        storage: &dyn StorageAdapter,
        key_a: &str,
        key_b: &str,
    ) -> Result<DiffResult> {
        let (stream_a, stream_b) = tokio::try_join!(storage.download(key_a), storage.download(key_b))?;
        let reader_a = open_records(stream_a).await?;
        let reader_b = open_records(stream_b).await?;

        let result = self.compare(reader_a, key_a, reader_b, key_b).await?;
        log_result(&result);
        Ok(result)
    }

    /// Diffs a stored snapshot (side A) against a live extraction (side B).
    ///
    /// The live side is read straight from the extractor and never stored.
    pub async fn compare_live(
        &self,
        storage: &dyn StorageAdapter,
        key: &str,
        live: Extraction,
    ) -> Result<DiffResult> {
        let label_b = format!("live:{}", live.metadata.engine);
        let stream_a = storage.download(key).await?;
        let reader_a = open_records(stream_a).await?;
        let reader_b = open_records(live.stream).await?;

        let result = self.compare(reader_a, key, reader_b, &label_b).await?;
        log_result(&result);
        Ok(result)
    }
}

/// Serializes a result once and uploads it under `key`.
pub async fn store_result(storage: &dyn StorageAdapter, key: &str, result: &DiffResult) -> Result<UploadResult> {
    let body = serde_json::to_vec(result)?;
    storage.upload(key, bytes_stream(body)).await
}

fn log_result(result: &DiffResult) {
    tracing::info!(
        snapshot_a = %result.snapshot_a,
        snapshot_b = %result.snapshot_b,
        added = result.summary.total_added,
        removed = result.summary.total_removed,
        modified = result.summary.total_modified,
        tables = result.tables.len(),
        skipped_lines = result.skipped_lines,
        "Diff complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BoxedRecordReader;
    use crate::storage::MemoryStorage;
    use crate::transfer::collect_bytes;
    use crate::utils::errors::SnapError;
    use serde_json::json;

    async fn reader(lines: &[&str]) -> BoxedRecordReader {
        open_records(bytes_stream(lines.join("\n"))).await.unwrap()
    }

    async fn diff(a: &[&str], b: &[&str]) -> DiffResult {
        DiffEngine::relational()
            .compare(reader(a).await, "a", reader(b).await, "b")
            .await
            .unwrap()
    }

    const HEADER: &str = r#"{"type":"header","engine":"postgres","structures":["products"],"timestamp":"2024-01-01T00:00:00Z"}"#;
    const START: &str = r#"{"type":"structure_start","name":"products","schema":{"indexes":[{"name":"products_pkey"}],"constraints":[]}}"#;
    const END: &str = r#"{"type":"structure_end","name":"products"}"#;

    fn snapshot_a() -> Vec<&'static str> {
        vec![
            HEADER,
            START,
            r#"{"type":"row","table":"products","data":{"id":1,"name":"Phone","price":500}}"#,
            r#"{"type":"row","table":"products","data":{"id":2,"name":"Laptop","price":1000}}"#,
            END,
        ]
    }

    fn snapshot_b() -> Vec<&'static str> {
        vec![
            HEADER,
            START,
            r#"{"type":"row","table":"products","data":{"id":2,"name":"Laptop Pro","price":1200}}"#,
            r#"{"type":"row","table":"products","data":{"id":3,"name":"Tablet","price":300}}"#,
            END,
        ]
    }

    #[tokio::test]
    async fn test_products_example() {
        let result = diff(&snapshot_a(), &snapshot_b()).await;

        assert_eq!(
            result.summary,
            DiffSummary {
                total_added: 1,
                total_removed: 1,
                total_modified: 1
            }
        );
        assert_eq!(result.tables.len(), 1);
        assert_eq!(result.tables[0].name, "products");

        let by_type = |t: ChangeType| result.details.iter().find(|d| d.change_type == t).unwrap();
        let added = by_type(ChangeType::Added);
        assert_eq!(added.object_id, "3");
        assert!(added.before.is_none());

        let removed = by_type(ChangeType::Removed);
        assert_eq!(removed.object_id, "1");
        assert!(removed.after.is_none());

        let modified = by_type(ChangeType::Modified);
        assert_eq!(modified.object_id, "2");
        assert_eq!(modified.before.as_ref().unwrap()["price"], json!(1000));
        assert_eq!(modified.after.as_ref().unwrap()["price"], json!(1200));
    }

    #[tokio::test]
    async fn test_compare_with_itself_is_empty() {
        let result = diff(&snapshot_a(), &snapshot_a()).await;
        assert_eq!(result.summary, DiffSummary::default());
        assert!(result.tables.is_empty());
        assert!(result.details.is_empty());
    }

    #[tokio::test]
    async fn test_side_swap_symmetry() {
        let forward = diff(&snapshot_a(), &snapshot_b()).await;
        let backward = diff(&snapshot_b(), &snapshot_a()).await;
        assert_eq!(forward.summary.total_added, backward.summary.total_removed);
        assert_eq!(forward.summary.total_removed, backward.summary.total_added);
        assert_eq!(forward.summary.total_modified, backward.summary.total_modified);
    }

    #[tokio::test]
    async fn test_record_and_field_order_ignored() {
        let a = [
            r#"{"type":"row","table":"t","data":{"id":1,"v":"x"}}"#,
            r#"{"type":"row","table":"t","data":{"id":2,"v":"y"}}"#,
        ];
        let b = [
            r#"{"type":"row","table":"t","data":{"v":"y","id":2}}"#,
            r#"{"type":"row","table":"t","data":{"id":1,"v":"x"}}"#,
        ];
        let result = diff(&a, &b).await;
        assert_eq!(result.summary, DiffSummary::default());
        assert!(result.tables.is_empty());
    }

    #[tokio::test]
    async fn test_schema_only_change() {
        let a = [r#"{"type":"structure_start","name":"users","schema":{"indexes":[{"name":"users_pkey"}]}}"#,
            r#"{"type":"row","table":"users","data":{"id":1}}"#];
        let b = [r#"{"type":"structure_start","name":"users","schema":{"indexes":[{"name":"users_pkey"},{"name":"ix_new"}]}}"#,
            r#"{"type":"row","table":"users","data":{"id":1}}"#];
        let result = diff(&a, &b).await;

        assert_eq!(result.summary, DiffSummary::default());
        assert_eq!(result.tables.len(), 1);
        let table = &result.tables[0];
        assert_eq!((table.added, table.removed, table.modified), (0, 0, 0));
        assert_eq!(table.schema_changes.added_indexes, vec!["ix_new"]);
        assert!(table.schema_changes.removed_indexes.is_empty());
    }

    #[tokio::test]
    async fn test_nested_change_is_modified() {
        let a = [r#"{"type":"row","table":"t","data":{"id":1,"meta":{"tags":["a","b"]}}}"#];
        let b = [r#"{"type":"row","table":"t","data":{"id":1,"meta":{"tags":["b","a"]}}}"#];
        let result = diff(&a, &b).await;
        assert_eq!(result.summary.total_modified, 1);
    }

    #[tokio::test]
    async fn test_interleaved_structures_and_skipped_lines() {
        let a = [
            r#"{"type":"row","table":"t","data":{"id":1}}"#,
            r#"{"type":"row","table":"u","data":{"id":1}}"#,
            "garbage",
            r#"{"type":"row","table":"t","data":{"id":2}}"#,
        ];
        let b = [
            r#"{"type":"row","table":"u","data":{"id":1}}"#,
            r#"{"type":"row","table":"t","data":{"id":2}}"#,
            r#"{"type":"row","table":"t","data":{"id":1}}"#,
        ];
        let result = diff(&a, &b).await;
        assert_eq!(result.summary, DiffSummary::default());
        assert_eq!(result.skipped_lines, 1);
    }

    #[tokio::test]
    async fn test_structure_name_rows_are_compared() {
        let a = [r#"{"type":"row","structureName":"products","data":{"id":1,"price":500}}"#];
        let b = [r#"{"type":"row","structureName":"products","data":{"id":1,"price":900}}"#];
        let result = diff(&a, &b).await;
        assert_eq!(result.summary.total_modified, 1);
        assert_eq!(result.skipped_lines, 0);
        assert_eq!(result.details[0].structure_name, "products");
    }

    #[tokio::test]
    async fn test_numeric_and_text_ids_are_distinct() {
        let a = [
            r#"{"type":"row","table":"t","data":{"id":1,"v":"num"}}"#,
            r#"{"type":"row","table":"t","data":{"id":"1","v":"str"}}"#,
        ];
        let b = [r#"{"type":"row","table":"t","data":{"id":1,"v":"num"}}"#];
        let result = diff(&a, &b).await;

        assert_eq!(
            result.summary,
            DiffSummary {
                total_added: 0,
                total_removed: 1,
                total_modified: 0
            }
        );
        let removed = &result.details[0];
        assert_eq!(removed.object_id, "1");
        assert_eq!(removed.before.as_ref().unwrap()["v"], json!("str"));
    }

    #[tokio::test]
    async fn test_document_engine_keys_by_object_id() {
        let a = [r#"{"type":"document","collection":"c","data":{"_id":{"$oid":"aa"},"n":1}}"#];
        let b = [r#"{"type":"document","collection":"c","data":{"n":2,"_id":{"$oid":"aa"}}}"#];
        let result = DiffEngine::document()
            .compare(reader(&a).await, "a", reader(&b).await, "b")
            .await
            .unwrap();
        assert_eq!(result.details.len(), 1);
        assert_eq!(result.details[0].object_id, "aa");
        assert_eq!(result.details[0].change_type, ChangeType::Modified);
    }

    #[tokio::test]
    async fn test_serialized_shape() {
        let result = diff(&snapshot_a(), &snapshot_b()).await;
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["snapshotA"], json!("a"));
        assert_eq!(value["summary"]["totalAdded"], json!(1));
        assert_eq!(value["tables"][0]["schemaChanges"]["addedIndexes"], json!([]));
        // Details follow key order: id 1 removed, 2 modified, 3 added.
        assert_eq!(value["details"][0]["type"], json!("REMOVED"));
        assert!(value["details"][0].get("after").is_none());
        assert_eq!(value["details"][2]["type"], json!("ADDED"));
        assert_eq!(value["details"][2]["objectId"], json!("3"));
        assert!(value["details"][2].get("before").is_none());
        assert!(value.get("skippedLines").is_none());
    }

    #[tokio::test]
    async fn test_compare_snapshots_and_store() {
        let storage = MemoryStorage::new();
        storage
            .upload("snapshots/p/a.jsonl", bytes_stream(snapshot_a().join("\n")))
            .await
            .unwrap();
        storage
            .upload("snapshots/p/b.jsonl", bytes_stream(snapshot_b().join("\n")))
            .await
            .unwrap();

        let engine = DiffEngine::relational();
        let result = engine
            .compare_snapshots(&storage, "snapshots/p/a.jsonl", "snapshots/p/b.jsonl")
            .await
            .unwrap();
        assert_eq!(result.snapshot_a, "snapshots/p/a.jsonl");

        store_result(&storage, "diffs/a-b.json", &result).await.unwrap();
        let stored = collect_bytes(storage.download("diffs/a-b.json").await.unwrap())
            .await
            .unwrap();
        let parsed: DiffResult = serde_json::from_slice(&stored).unwrap();
        assert_eq!(parsed, result);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_fatal() {
        let storage = MemoryStorage::new();
        storage
            .upload("snapshots/p/a.jsonl", bytes_stream(snapshot_a().join("\n")))
            .await
            .unwrap();
        let err = DiffEngine::relational()
            .compare_snapshots(&storage, "snapshots/p/a.jsonl", "snapshots/p/missing.jsonl")
            .await
            .unwrap_err();
        assert!(matches!(err, SnapError::NotFound(_)));
    }
}
