//! Materialized records
//!
//! A [`Record`] is one row of a model together with the relations resolved
//! for it. Serializing a record yields its data only: resolved relations live
//! in a hidden [`RelationCache`] and are surfaced solely through
//! [`Record::to_object`] or the relation accessors.

use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::{ModelError, ModelResult};
use crate::filter::Row;
use crate::relationships::cache::{RelationCache, RelationValue};
use crate::relationships::identity_map::FieldSource;

/// Default primary key property
pub const DEFAULT_ID_PROPERTY: &str = "id";

/// One materialized row of a model
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    model: String,
    id_property: String,
    data: Row,
    relations: RelationCache,
    persisted: bool,
}

impl Record {
    /// Create an unsaved record
    pub fn new(model: &str, data: Row) -> Self {
        Self {
            model: model.to_string(),
            id_property: DEFAULT_ID_PROPERTY.to_string(),
            data,
            relations: RelationCache::new(),
            persisted: false,
        }
    }

    /// Create an unsaved record from a JSON object
    pub fn from_value(model: &str, value: Value) -> ModelResult<Self> {
        match value {
            Value::Object(data) => Ok(Self::new(model, data)),
            other => Err(ModelError::Serialization(format!(
                "Record data for '{}' must be an object, got {}",
                model, other
            ))),
        }
    }

    /// Create a record for a row read from storage
    pub(crate) fn persisted(model: &str, id_property: &str, data: Row) -> Self {
        Self {
            model: model.to_string(),
            id_property: id_property.to_string(),
            data,
            relations: RelationCache::new(),
            persisted: true,
        }
    }

    /// Use a primary key property other than `id`
    pub fn with_id_property(mut self, id_property: &str) -> Self {
        self.id_property = id_property.to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn id_property(&self) -> &str {
        &self.id_property
    }

    /// Primary key value, if set and not null
    pub fn id(&self) -> Option<&Value> {
        self.data.get(&self.id_property).filter(|v| !v.is_null())
    }

    /// Primary key value, failing if absent
    pub fn require_id(&self) -> ModelResult<&Value> {
        self.id().ok_or(ModelError::MissingPrimaryKey)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Option<Value> {
        self.data.insert(field.to_string(), value.into())
    }

    pub fn unset(&mut self, field: &str) -> Option<Value> {
        self.data.remove(field)
    }

    pub fn data(&self) -> &Row {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Row {
        &mut self.data
    }

    pub fn into_data(self) -> Row {
        self.data
    }

    /// Copy every field of `attributes` onto this record
    pub fn apply(&mut self, attributes: &Row) {
        for (key, value) in attributes {
            self.data.insert(key.clone(), value.clone());
        }
    }

    /// Whether the record was read from or written to storage
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub(crate) fn mark_persisted(&mut self, data: Row) {
        self.data = data;
        self.persisted = true;
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.persisted = false;
    }

    /// Cached value of a relation, if it was resolved
    pub fn relation(&self, name: &str) -> Option<&RelationValue> {
        self.relations.get(name)
    }

    pub fn relations(&self) -> &RelationCache {
        &self.relations
    }

    pub fn relations_mut(&mut self) -> &mut RelationCache {
        &mut self.relations
    }

    pub(crate) fn set_relation(&mut self, name: &str, value: RelationValue) {
        self.relations.set(name, value);
    }

    /// Public JSON form; resolved relations are nested under their names
    /// when `with_relations` is set
    pub fn to_object(&self, with_relations: bool) -> Value {
        let mut out = self.data.clone();
        if with_relations {
            for (name, value) in self.relations.iter() {
                out.insert(name.clone(), value.to_value(true));
            }
        }
        Value::Object(out)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}

impl FieldSource for Record {
    fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> Record {
        Record::from_value("User", json!({ "id": 1, "name": "A" })).unwrap()
    }

    #[test]
    fn test_serialize_hides_relation_cache() {
        let mut record = user();
        let post = Record::from_value("Post", json!({ "id": 10, "userId": 1 })).unwrap();
        record.set_relation("posts", RelationValue::many(vec![post]));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json, json!({ "id": 1, "name": "A" }));
        assert!(json.get("posts").is_none());
    }

    #[test]
    fn test_to_object_nests_relations() {
        let mut record = user();
        let passport = Record::from_value("Passport", json!({ "id": 3, "ownerId": 1 })).unwrap();
        record.set_relation("passport", RelationValue::one(Some(passport)));
        record.set_relation("posts", RelationValue::many(vec![]));

        assert_eq!(
            record.to_object(true),
            json!({ "id": 1, "name": "A", "passport": { "id": 3, "ownerId": 1 }, "posts": [] })
        );
        assert_eq!(record.to_object(false), json!({ "id": 1, "name": "A" }));
    }

    #[test]
    fn test_id_and_custom_id_property() {
        let record = Record::from_value("Book", json!({ "isbn": "x-1", "id": null }))
            .unwrap()
            .with_id_property("isbn");
        assert_eq!(record.id(), Some(&json!("x-1")));

        let blank = Record::from_value("Book", json!({ "id": null })).unwrap();
        assert!(blank.id().is_none());
        assert!(matches!(blank.require_id(), Err(ModelError::MissingPrimaryKey)));
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(Record::from_value("User", json!([1, 2])).is_err());
    }
}
