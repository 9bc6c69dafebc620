//! Canonical snapshot stream format.
//!
//! A snapshot is newline-delimited JSON. Every line is one [`Record`],
//! discriminated by its `type` field:
//!
//! ```text
//! {"type":"header","engine":"postgres","structures":["users"],"timestamp":"..."}
//! {"type":"structure_start","name":"users","schema":{"indexes":[...],"constraints":[...]}}
//! {"type":"row","table":"users","data":{"id":1,"name":"Ada"}}
//! {"type":"structure_end","name":"users"}
//! ```
//!
//! Document engines emit `{"type":"document","collection":...,"data":...}`
//! in place of `row`. Readers also accept `structureName` for either
//! field; writers always emit `table` or `collection`.

pub mod reader;
pub mod writer;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use reader::{open_records, BoxedRecordReader, RecordReader};
pub use writer::RecordSink;

/// Field name to value, in source order.
pub type RecordData = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Header(Header),
    StructureStart {
        name: String,
        #[serde(default)]
        schema: StructureSchema,
    },
    Row {
        #[serde(alias = "structureName")]
        table: String,
        data: RecordData,
    },
    Document {
        #[serde(alias = "structureName")]
        collection: String,
        data: RecordData,
    },
    StructureEnd {
        name: String,
    },
}

impl Record {
    /// Structure a data record belongs to; `None` for framing records.
    pub fn structure_name(&self) -> Option<&str> {
        match self {
            Record::Row { table, .. } => Some(table),
            Record::Document { collection, .. } => Some(collection),
            _ => None,
        }
    }

    /// Splits a data record into its structure name and payload.
    pub fn into_data(self) -> Option<(String, RecordData)> {
        match self {
            Record::Row { table, data } => Some((table, data)),
            Record::Document { collection, data } => Some((collection, data)),
            _ => None,
        }
    }

    /// Serializes the record as one line, newline included.
    pub fn to_line(&self) -> serde_json::Result<Bytes> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Engine name as written by the extractor. Kept as text so snapshots
    /// from engines this build does not know still parse.
    pub engine: String,
    #[serde(default)]
    pub structures: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Index and constraint descriptors captured at `structure_start`.
///
/// Only names take part in comparisons; definitions are carried opaquely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructureSchema {
    #[serde(default)]
    pub indexes: Vec<SchemaObject>,
    #[serde(default)]
    pub constraints: Vec<SchemaObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaObject {
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub definition: Value,
}

impl SchemaObject {
    pub fn new(name: impl Into<String>, definition: Value) -> Self {
        Self {
            name: name.into(),
            definition,
        }
    }
}

impl StructureSchema {
    pub fn index_names(&self) -> impl Iterator<Item = &str> {
        self.indexes.iter().map(|i| i.name.as_str())
    }

    pub fn constraint_names(&self) -> impl Iterator<Item = &str> {
        self.constraints.iter().map(|c| c.name.as_str())
    }
}
