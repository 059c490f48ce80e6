//! Relationship Cache - per-record storage for resolved relations
//!
//! Each materialized record owns one cache. Entries are written by the
//! inclusion resolver and by accessors, and are only replaced by an explicit
//! refresh or assignment. The cache is never part of a record's public JSON.

use std::collections::HashMap;

use serde_json::Value;

use crate::record::Record;

/// A resolved relation value
#[derive(Debug, Clone, PartialEq)]
pub enum RelationValue {
    /// Single-valued relation (belongsTo, hasOne, embedsOne); `None` when absent
    One(Option<Box<Record>>),
    /// List-valued relation
    Many(Vec<Record>),
}

impl RelationValue {
    pub fn one(record: Option<Record>) -> Self {
        RelationValue::One(record.map(Box::new))
    }

    pub fn many(records: Vec<Record>) -> Self {
        RelationValue::Many(records)
    }

    /// Empty value of the right shape
    pub fn empty(multiple: bool) -> Self {
        if multiple {
            RelationValue::Many(Vec::new())
        } else {
            RelationValue::One(None)
        }
    }

    pub fn as_one(&self) -> Option<&Record> {
        match self {
            RelationValue::One(record) => record.as_deref(),
            RelationValue::Many(_) => None,
        }
    }

    pub fn as_many(&self) -> Option<&[Record]> {
        match self {
            RelationValue::Many(records) => Some(records.as_slice()),
            RelationValue::One(_) => None,
        }
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        match self {
            RelationValue::One(record) => usize::from(record.is_some()),
            RelationValue::Many(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the contained records
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        let (one, many): (Option<&Record>, &[Record]) = match self {
            RelationValue::One(record) => (record.as_deref(), &[]),
            RelationValue::Many(records) => (None, records.as_slice()),
        };
        one.into_iter().chain(many.iter())
    }

    /// Public JSON form, optionally nesting the children's own relations
    pub fn to_value(&self, with_relations: bool) -> Value {
        match self {
            RelationValue::One(Some(record)) => record.to_object(with_relations),
            RelationValue::One(None) => Value::Null,
            RelationValue::Many(records) => Value::Array(
                records.iter().map(|r| r.to_object(with_relations)).collect(),
            ),
        }
    }
}

/// Hidden map from relation name to resolved value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationCache {
    entries: HashMap<String, RelationValue>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, relation: &str) -> Option<&RelationValue> {
        self.entries.get(relation)
    }

    pub fn get_mut(&mut self, relation: &str) -> Option<&mut RelationValue> {
        self.entries.get_mut(relation)
    }

    pub fn contains(&self, relation: &str) -> bool {
        self.entries.contains_key(relation)
    }

    /// Store a resolved value, replacing any previous one
    pub fn set(&mut self, relation: &str, value: RelationValue) -> Option<RelationValue> {
        self.entries.insert(relation.to_string(), value)
    }

    /// Drop a cached value so the next access fetches again
    pub fn invalidate(&mut self, relation: &str) -> Option<RelationValue> {
        self.entries.remove(relation)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached relations, sorted by name for stable output
    pub fn iter(&self) -> impl Iterator<Item = (&String, &RelationValue)> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: i64) -> Record {
        Record::from_value("Post", json!({ "id": id })).unwrap()
    }

    #[test]
    fn test_set_and_invalidate() {
        let mut cache = RelationCache::new();
        assert!(cache.set("posts", RelationValue::many(vec![record(1)])).is_none());
        assert!(cache.contains("posts"));
        assert_eq!(cache.get("posts").map(RelationValue::len), Some(1));

        assert!(cache.invalidate("posts").is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_empty_shapes() {
        assert_eq!(RelationValue::empty(true), RelationValue::Many(vec![]));
        assert_eq!(RelationValue::empty(false), RelationValue::One(None));
        assert!(RelationValue::empty(false).is_empty());
    }

    #[test]
    fn test_records_iterates_both_shapes() {
        let one = RelationValue::one(Some(record(7)));
        assert_eq!(one.records().count(), 1);
        let many = RelationValue::many(vec![record(1), record(2)]);
        let ids: Vec<_> = many.records().map(|r| r.get("id").cloned()).collect();
        assert_eq!(ids, vec![Some(json!(1)), Some(json!(2))]);
    }

    #[test]
    fn test_to_value() {
        assert_eq!(RelationValue::one(None).to_value(false), Value::Null);
        assert_eq!(
            RelationValue::many(vec![record(1)]).to_value(false),
            json!([{ "id": 1 }])
        );
    }
}
