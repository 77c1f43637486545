//! Query specifications: `{kind, filter, sort}` over an `EntityStore`.
//!
//! Deliberately small: equality filters and a single sort key.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::record::{EntityKind, EntityStore, Record};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// A live-query definition. Two specs with equal canonical keys share one
/// computation in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub kind: EntityKind,
    /// Field equality constraints; `null` matches a missing field.
    #[serde(default)]
    pub filter: BTreeMap<String, Value>,
    #[serde(default)]
    pub sort: Option<Sort>,
}

impl QuerySpec {
    pub fn all(kind: EntityKind) -> Self {
        Self {
            kind,
            filter: BTreeMap::new(),
            sort: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(field.into(), value.into());
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.sort = Some(Sort {
            field: field.into(),
            descending,
        });
        self
    }

    /// Canonical JSON: object keys are ordered, so equal specs give equal keys.
    pub fn canonical_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn matches(&self, record: &Record) -> bool {
        record.kind == self.kind
            && self
                .filter
                .iter()
                .all(|(field, expected)| record.get(field).unwrap_or(&Value::Null) == expected)
    }

    /// Evaluate against a store. Ties (and unsorted results) fall back to id order.
    pub fn evaluate(&self, store: &EntityStore) -> Vec<Record> {
        let mut rows: Vec<Record> = store
            .of_kind(self.kind)
            .filter(|record| self.matches(record))
            .cloned()
            .collect();
        if let Some(sort) = &self.sort {
            rows.sort_by(|a, b| {
                let ord = compare_values(a.get(&sort.field), b.get(&sort.field));
                let ord = if sort.descending { ord.reverse() } else { ord };
                ord.then_with(|| a.id.cmp(&b.id))
            });
        }
        rows
    }
}

/// Missing < null < bool < number < string; arrays and objects compare by
/// their JSON text.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x @ (Value::Array(_) | Value::Object(_))), Some(y @ (Value::Array(_) | Value::Object(_)))) => {
            x.to_string().cmp(&y.to_string())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs() -> EntityStore {
        EntityStore::from_records([
            Record::new(EntityKind::Document, "d1").with("title", "b").with("folder_id", "f1"),
            Record::new(EntityKind::Document, "d2").with("title", "a").with("folder_id", "f1"),
            Record::new(EntityKind::Document, "d3").with("title", "c"),
            Record::new(EntityKind::Folder, "f1").with("name", "Work"),
        ])
    }

    #[test]
    fn test_filter_and_sort() {
        let spec = QuerySpec::all(EntityKind::Document)
            .filter("folder_id", "f1")
            .sort_by("title", false);
        let ids: Vec<String> = spec.evaluate(&docs()).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["d2", "d1"]);
    }

    #[test]
    fn test_null_filter_matches_missing_field() {
        let spec = QuerySpec::all(EntityKind::Document).filter("folder_id", Value::Null);
        let ids: Vec<String> = spec.evaluate(&docs()).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["d3"]);
    }

    #[test]
    fn test_canonical_key_ignores_builder_order() {
        let a = QuerySpec::all(EntityKind::Document).filter("x", 1).filter("y", 2);
        let b = QuerySpec::all(EntityKind::Document).filter("y", 2).filter("x", 1);
        assert_eq!(a.canonical_key(), b.canonical_key());
        assert_ne!(a.canonical_key(), QuerySpec::all(EntityKind::Folder).canonical_key());
    }

    #[test]
    fn test_descending_numbers() {
        let store = EntityStore::from_records([
            Record::new(EntityKind::Document, "a").with("updated_at", 5),
            Record::new(EntityKind::Document, "b").with("updated_at", 50),
            Record::new(EntityKind::Document, "c"),
        ]);
        let spec = QuerySpec::all(EntityKind::Document).sort_by("updated_at", true);
        let ids: Vec<String> = spec.evaluate(&store).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }
}
