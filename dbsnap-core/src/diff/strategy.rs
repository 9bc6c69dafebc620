//! Per-engine pieces of the diff: how records are keyed and which schema
//! objects are compared.

use super::canonical::{canonical_json, canonical_map};
use super::SchemaChanges;
use crate::format::{RecordData, StructureSchema};
use serde_json::Value;
use std::collections::BTreeSet;

/// Identity of a record within its structure.
///
/// `identity` is the canonical JSON of the key value, so `1` and `"1"` are
/// different records. `display` is what a diff reports as `objectId`: strings
/// and ObjectIds unquoted, everything else canonical JSON. Ordering follows
/// `identity`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    identity: String,
    display: String,
}

impl RecordKey {
    fn of_value(value: &Value) -> Self {
        let identity = canonical_json(value);
        let display = match value {
            Value::String(s) => s.clone(),
            _ => identity.clone(),
        };
        Self { identity, display }
    }

    fn of_content(data: &RecordData) -> Self {
        let identity = canonical_map(data);
        Self {
            display: identity.clone(),
            identity,
        }
    }

    pub fn into_display(self) -> String {
        self.display
    }
}

pub trait RecordKeyer: Send + Sync {
    fn key(&self, data: &RecordData) -> RecordKey;
}

pub trait SchemaComparer: Send + Sync {
    /// Name-level differences going from `a` to `b`. A missing schema counts
    /// as one with no indexes or constraints.
    fn compare(&self, a: Option<&StructureSchema>, b: Option<&StructureSchema>) -> SchemaChanges;
}

/// `id`, then `uuid`, then `ID`; rows without any of them are keyed by content.
pub struct RelationalKeyer;

const RELATIONAL_KEY_FIELDS: [&str; 3] = ["id", "uuid", "ID"];

impl RecordKeyer for RelationalKeyer {
    fn key(&self, data: &RecordData) -> RecordKey {
        RELATIONAL_KEY_FIELDS
            .iter()
            .filter_map(|field| data.get(*field))
            .find(|value| !value.is_null())
            .map(RecordKey::of_value)
            .unwrap_or_else(|| RecordKey::of_content(data))
    }
}

/// `_id`. Extended-JSON ObjectIds display as their hex string but stay
/// distinct from a plain string `_id` with the same text.
pub struct DocumentKeyer;

impl RecordKeyer for DocumentKeyer {
    fn key(&self, data: &RecordData) -> RecordKey {
        match data.get("_id") {
            Some(Value::Object(id)) => match id.get("$oid") {
                Some(Value::String(oid)) if id.len() == 1 => RecordKey {
                    identity: canonical_map(id),
                    display: oid.clone(),
                },
                _ => RecordKey::of_content(id),
            },
            Some(value) if !value.is_null() => RecordKey::of_value(value),
            _ => RecordKey::of_content(data),
        }
    }
}

/// Compares index and constraint names.
pub struct RelationalSchemaComparer;

impl SchemaComparer for RelationalSchemaComparer {
    fn compare(&self, a: Option<&StructureSchema>, b: Option<&StructureSchema>) -> SchemaChanges {
        let (added_indexes, removed_indexes) =
            name_changes(a.map(|s| s.index_names()), b.map(|s| s.index_names()));
        let (added_constraints, removed_constraints) =
            name_changes(a.map(|s| s.constraint_names()), b.map(|s| s.constraint_names()));
        SchemaChanges {
            added_indexes,
            removed_indexes,
            added_constraints,
            removed_constraints,
        }
    }
}

/// Compares index names only; document stores have no constraints.
pub struct DocumentSchemaComparer;

impl SchemaComparer for DocumentSchemaComparer {
    fn compare(&self, a: Option<&StructureSchema>, b: Option<&StructureSchema>) -> SchemaChanges {
        let (added_indexes, removed_indexes) =
            name_changes(a.map(|s| s.index_names()), b.map(|s| s.index_names()));
        SchemaChanges {
            added_indexes,
            removed_indexes,
            ..SchemaChanges::default()
        }
    }
}

/// Returns `(in b but not a, in a but not b)`, each sorted.
fn name_changes<'a>(
    a: Option<impl Iterator<Item = &'a str>>,
    b: Option<impl Iterator<Item = &'a str>>,
) -> (Vec<String>, Vec<String>) {
    let a: BTreeSet<&str> = a.map(|names| names.collect()).unwrap_or_default();
    let b: BTreeSet<&str> = b.map(|names| names.collect()).unwrap_or_default();
    (
        b.difference(&a).map(|s| s.to_string()).collect(),
        a.difference(&b).map(|s| s.to_string()).collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SchemaObject;
    use serde_json::json;

    fn data(value: Value) -> RecordData {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn shown(key: RecordKey) -> String {
        key.into_display()
    }

    #[test]
    fn test_relational_key_precedence() {
        let keyer = RelationalKeyer;
        assert_eq!(shown(keyer.key(&data(json!({"uuid": "u-1", "id": 7})))), "7");
        assert_eq!(shown(keyer.key(&data(json!({"uuid": "u-1", "ID": 3})))), "u-1");
        assert_eq!(shown(keyer.key(&data(json!({"ID": "X9"})))), "X9");
        assert_eq!(shown(keyer.key(&data(json!({"id": null, "uuid": "u-2"})))), "u-2");
    }

    #[test]
    fn test_key_type_is_part_of_identity() {
        let keyer = RelationalKeyer;
        let number = keyer.key(&data(json!({"id": 1})));
        let text = keyer.key(&data(json!({"id": "1"})));
        assert_ne!(number, text);
        assert_eq!(shown(number), shown(text));

        let oid = DocumentKeyer.key(&data(json!({"_id": {"$oid": "abc"}})));
        let plain = DocumentKeyer.key(&data(json!({"_id": "abc"})));
        assert_ne!(oid, plain);
        assert_eq!(shown(oid), "abc");
    }

    #[test]
    fn test_keyless_rows_keyed_by_content() {
        let keyer = RelationalKeyer;
        let a = keyer.key(&data(json!({"name": "x", "qty": 1})));
        let b = keyer.key(&data(json!({"qty": 1, "name": "x"})));
        assert_eq!(a, b);
        assert_eq!(shown(a), r#"{"name":"x","qty":1}"#);
    }

    #[test]
    fn test_document_keys() {
        let keyer = DocumentKeyer;
        assert_eq!(
            shown(keyer.key(&data(json!({"_id": {"$oid": "65f0c0ffee00000000000001"}, "n": 1})))),
            "65f0c0ffee00000000000001"
        );
        assert_eq!(shown(keyer.key(&data(json!({"_id": "slug"})))), "slug");
        assert_eq!(shown(keyer.key(&data(json!({"_id": 42})))), "42");
        assert_eq!(shown(keyer.key(&data(json!({"_id": {"b": 1, "a": 2}})))), r#"{"a":2,"b":1}"#);
    }

    fn schema(indexes: &[&str], constraints: &[&str]) -> StructureSchema {
        StructureSchema {
            indexes: indexes.iter().map(|n| SchemaObject::new(*n, Value::Null)).collect(),
            constraints: constraints.iter().map(|n| SchemaObject::new(*n, Value::Null)).collect(),
        }
    }

    #[test]
    fn test_relational_schema_changes() {
        let a = schema(&["pk", "ix_old"], &["fk_a"]);
        let b = schema(&["pk", "ix_new"], &["fk_b"]);
        let changes = RelationalSchemaComparer.compare(Some(&a), Some(&b));
        assert_eq!(changes.added_indexes, vec!["ix_new"]);
        assert_eq!(changes.removed_indexes, vec!["ix_old"]);
        assert_eq!(changes.added_constraints, vec!["fk_b"]);
        assert_eq!(changes.removed_constraints, vec!["fk_a"]);
    }

    #[test]
    fn test_document_schema_ignores_constraints() {
        let a = schema(&["_id_"], &["c1"]);
        let b = schema(&["_id_", "email_1"], &[]);
        let changes = DocumentSchemaComparer.compare(Some(&a), Some(&b));
        assert_eq!(changes.added_indexes, vec!["email_1"]);
        assert!(changes.removed_constraints.is_empty());
    }

    #[test]
    fn test_missing_schema_side() {
        let b = schema(&["pk"], &[]);
        let changes = RelationalSchemaComparer.compare(None, Some(&b));
        assert_eq!(changes.added_indexes, vec!["pk"]);
        assert!(RelationalSchemaComparer.compare(None, None).is_empty());
    }
}
