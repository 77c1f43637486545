//! Structured metadata records and the store mutators read and write.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Kinds of structured entity kept beside the documents themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Document,
    Folder,
    Collection,
}

/// One entity: a kind, an id unique within the kind, and JSON fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: EntityKind,
    pub id: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// String field, `None` when missing or not a string.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }
}

/// One state change produced by a mutator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    /// Replace the whole record.
    Upsert { record: Record },
    Delete { kind: EntityKind, id: String },
}

/// Everything one mutation changed, applied in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    pub changes: Vec<Change>,
}

impl Effect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(mut self, record: Record) -> Self {
        self.changes.push(Change::Upsert { record });
        self
    }

    pub fn delete(mut self, kind: EntityKind, id: impl Into<String>) -> Self {
        self.changes.push(Change::Delete { kind, id: id.into() });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// The upserted record for `(kind, id)`, if this effect writes one.
    pub fn upserted(&self, kind: EntityKind, id: &str) -> Option<&Record> {
        self.changes.iter().rev().find_map(|change| match change {
            Change::Upsert { record } if record.kind == kind && record.id == id => Some(record),
            _ => None,
        })
    }
}

/// Ordered map of records, keyed by `(kind, id)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityStore {
    records: BTreeMap<(EntityKind, String), Record>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<&Record> {
        self.records.get(&(kind, id.to_string()))
    }

    pub fn contains(&self, kind: EntityKind, id: &str) -> bool {
        self.get(kind, id).is_some()
    }

    pub fn insert(&mut self, record: Record) {
        self.records.insert((record.kind, record.id.clone()), record);
    }

    pub fn remove(&mut self, kind: EntityKind, id: &str) -> Option<Record> {
        self.records.remove(&(kind, id.to_string()))
    }

    /// All records of one kind, in id order.
    pub fn of_kind(&self, kind: EntityKind) -> impl Iterator<Item = &Record> {
        self.records
            .range((kind, String::new())..)
            .take_while(move |((k, _), _)| *k == kind)
            .map(|(_, record)| record)
    }

    /// Every record, ordered by kind then id.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn apply(&mut self, effect: &Effect) {
        for change in &effect.changes {
            match change {
                Change::Upsert { record } => self.insert(record.clone()),
                Change::Delete { kind, id } => {
                    self.remove(*kind, id);
                }
            }
        }
    }
}
