//! Embedded and referencesMany relation operations
//!
//! Embedded documents live inline on the owner under the relation property;
//! referencesMany keeps an array of target ids there. Every mutation rewrites
//! that property, persists it when the owner is persisted and drops the
//! cached relation value.

use serde_json::Value;
use uuid::Uuid;

use crate::error::{ModelError, ModelResult};
use crate::filter::Row;
use crate::record::Record;
use super::accessor::RelationAccessor;
use super::metadata::RelationType;
use super::registry::PropertyType;

impl<'a> RelationAccessor<'a> {
    /// The embedded document of an embedsOne relation
    pub fn value(&self) -> ModelResult<Option<Record>> {
        self.ensure_kind(&[RelationType::EmbedsOne], "value")?;
        let target = self.relation.target_model()?;
        let id_property = self.target_collection()?.id_property;
        Ok(match self.owner.get(&self.relation.key_from) {
            Some(Value::Object(row)) => Some(Record::new(target, row.clone()).with_id_property(&id_property)),
            _ => None,
        })
    }

    /// Embedded documents of an embedsMany relation, in stored order
    pub fn list(&self) -> ModelResult<Vec<Record>> {
        self.ensure_kind(&[RelationType::EmbedsMany], "list")?;
        let target = self.relation.target_model()?;
        let id_property = self.target_collection()?.id_property;
        Ok(self
            .embedded_items()
            .into_iter()
            .map(|row| Record::new(target, row).with_id_property(&id_property))
            .collect())
    }

    /// Ids held by a referencesMany relation, in stored order
    pub fn ids(&self) -> ModelResult<Vec<Value>> {
        self.ensure_kind(&[RelationType::ReferencesMany], "ids")?;
        Ok(match self.owner.get(&self.relation.key_from) {
            Some(Value::Array(ids)) => ids.iter().filter(|id| !id.is_null()).cloned().collect(),
            _ => Vec::new(),
        })
    }

    /// Build an embedded document, assigning an id when none is given
    /// (or always, with `forceId`). Nothing is stored.
    pub fn build_embedded(&self, attributes: Row) -> ModelResult<Record> {
        self.ensure_kind(&[RelationType::EmbedsOne, RelationType::EmbedsMany], "build")?;
        let collection = self.target_collection()?;
        let key = self.relation.key_to.clone();

        let mut data = attributes;
        let missing = data.get(&key).map_or(true, Value::is_null);
        if missing || self.relation.options.force_id {
            let id = next_id(&self.embedded_items(), &key, &collection.id_type);
            data.insert(key, id);
        }
        Ok(Record::new(&collection.name, data).with_id_property(&collection.id_property))
    }

    pub(crate) async fn create_embedded_or_referenced(&mut self, attributes: Row) -> ModelResult<Record> {
        match self.relation.kind {
            RelationType::EmbedsOne => {
                let item = self.build_embedded(attributes)?;
                self.store(Value::Object(item.data().clone())).await?;
                Ok(item)
            }
            RelationType::EmbedsMany => {
                let item = self.build_embedded(attributes)?;
                let mut items = self.embedded_items();
                let id = item.get(&self.relation.key_to).cloned().unwrap_or(Value::Null);
                if self.relation.options.validate && position(&items, &self.relation.key_to, &id).is_some() {
                    return Err(ModelError::Validation(format!(
                        "Duplicate id {} in '{}' of '{}'",
                        id, self.relation.name, self.relation.model_from
                    )));
                }
                items.push(item.data().clone());
                self.store(rows_value(items)).await?;
                Ok(item)
            }
            RelationType::ReferencesMany => {
                let target = self.relation.target_model()?.to_string();
                let created = self.source.create(&target, attributes).await?;
                self.add_reference(&created).await?;
                Ok(created)
            }
            kind => Err(ModelError::Relationship(format!(
                "Operation 'create' is not supported by {} relation '{}'",
                kind, self.relation.name
            ))),
        }
    }

    pub(crate) async fn find_by_id_local(&self, id: &Value) -> ModelResult<Record> {
        let collection = self.target_collection()?;
        match self.relation.kind {
            RelationType::ReferencesMany => {
                if !self.ids()?.iter().any(|held| loosely_equal(held, id)) {
                    return Err(ModelError::NotFound(collection.name));
                }
                self.source
                    .find_by_id(&collection.name, id, None)
                    .await?
                    .ok_or(ModelError::NotFound(collection.name))
            }
            RelationType::EmbedsOne => self
                .value()?
                .filter(|item| item.get(&self.relation.key_to).map_or(false, |v| loosely_equal(v, id)))
                .ok_or(ModelError::NotFound(collection.name)),
            _ => {
                let items = self.embedded_items();
                position(&items, &self.relation.key_to, id)
                    .map(|i| Record::new(&collection.name, items[i].clone()).with_id_property(&collection.id_property))
                    .ok_or(ModelError::NotFound(collection.name))
            }
        }
    }

    pub(crate) fn count_local(&self) -> ModelResult<usize> {
        Ok(match self.relation.kind {
            RelationType::ReferencesMany => self.ids()?.len(),
            RelationType::EmbedsOne => usize::from(self.value()?.is_some()),
            _ => self.embedded_items().len(),
        })
    }

    pub(crate) async fn update_embedded_by_id(&mut self, id: &Value, data: Row) -> ModelResult<Record> {
        self.ensure_kind(&[RelationType::EmbedsMany], "update_by_id")?;
        let collection = self.target_collection()?;
        let mut items = self.embedded_items();
        let index = position(&items, &self.relation.key_to, id).ok_or_else(|| ModelError::NotFound(collection.name.clone()))?;

        let key = self.relation.key_to.clone();
        for (field, value) in data {
            // the embedded id is immutable
            if field != key {
                items[index].insert(field, value);
            }
        }
        let updated = items[index].clone();
        self.store(rows_value(items)).await?;
        Ok(Record::new(&collection.name, updated).with_id_property(&collection.id_property))
    }

    pub(crate) async fn destroy_embedded_by_id(&mut self, id: &Value) -> ModelResult<bool> {
        self.ensure_kind(&[RelationType::EmbedsMany], "destroy_by_id")?;
        let mut items = self.embedded_items();
        match position(&items, &self.relation.key_to, id) {
            Some(index) => {
                items.remove(index);
                self.store(rows_value(items)).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) async fn update_embedded_one(&mut self, data: Row) -> ModelResult<Record> {
        let mut current = self
            .value()?
            .ok_or_else(|| ModelError::NotFound(self.relation.model_to.clone().unwrap_or_default()))?;
        let key = self.relation.key_to.clone();
        for (field, value) in data {
            if field != key {
                current.set(&field, value);
            }
        }
        self.store(Value::Object(current.data().clone())).await?;
        Ok(current)
    }

    pub(crate) async fn destroy_embedded_one(&mut self) -> ModelResult<bool> {
        let existed = self.value()?.is_some();
        if existed {
            self.store(Value::Null).await?;
        }
        Ok(existed)
    }

    /// Append the target's id unless it is already referenced
    pub(crate) async fn add_reference(&mut self, target: &Record) -> ModelResult<Record> {
        let id = target
            .get(&self.relation.key_to)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or(ModelError::MissingPrimaryKey)?;
        let mut ids = self.ids()?;
        if !ids.iter().any(|held| loosely_equal(held, &id)) {
            ids.push(id);
            self.store(Value::Array(ids)).await?;
        }
        Ok(target.clone())
    }

    pub(crate) async fn remove_reference(&mut self, id: &Value) -> ModelResult<bool> {
        let mut ids = self.ids()?;
        let before = ids.len();
        ids.retain(|held| !loosely_equal(held, id));
        if ids.len() == before {
            return Ok(false);
        }
        self.store(Value::Array(ids)).await?;
        Ok(true)
    }

    fn embedded_items(&self) -> Vec<Row> {
        match self.owner.get(&self.relation.key_from) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_object).cloned().collect(),
            Some(Value::Object(row)) => vec![row.clone()],
            _ => Vec::new(),
        }
    }

    /// Write the relation property on the owner and persist it
    async fn store(&mut self, value: Value) -> ModelResult<()> {
        let property = self.relation.key_from.clone();
        self.owner.set(&property, value.clone());
        self.owner.relations_mut().invalidate(&self.relation.name);

        let mut fields = Row::new();
        fields.insert(property, value);
        tracing::trace!(
            "Storing '{}' on '{}' ({})",
            self.relation.name,
            self.relation.model_from,
            if self.owner.is_persisted() { "persisted" } else { "unsaved" }
        );
        self.source.update_fields(self.owner, fields).await
    }
}

fn rows_value(items: Vec<Row>) -> Value {
    Value::Array(items.into_iter().map(Value::Object).collect())
}

fn position(items: &[Row], key: &str, id: &Value) -> Option<usize> {
    items
        .iter()
        .position(|item| item.get(key).map_or(false, |v| loosely_equal(v, id)))
}

/// Ids compare across number/string forms (`1` matches `"1"`)
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::String(y)) | (Value::String(y), Value::Number(x)) => x.to_string() == *y,
        _ => a == b,
    }
}

/// Next embedded id: a uuid for string ids, otherwise one past the largest numeric id
fn next_id(items: &[Row], key: &str, id_type: &PropertyType) -> Value {
    if *id_type == PropertyType::String {
        return Value::String(Uuid::new_v4().to_string());
    }
    let max = items
        .iter()
        .filter_map(|item| item.get(key).and_then(Value::as_i64))
        .max()
        .unwrap_or(0);
    Value::from(max + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(value: Value) -> Vec<Row> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn test_next_numeric_id() {
        let items = rows(json!([{ "id": 3 }, { "id": 7 }, { "id": "x" }]));
        assert_eq!(next_id(&items, "id", &PropertyType::Number), json!(8));
        assert_eq!(next_id(&[], "id", &PropertyType::Number), json!(1));
    }

    #[test]
    fn test_next_string_id_is_uuid() {
        let id = next_id(&[], "id", &PropertyType::String);
        assert!(Uuid::parse_str(id.as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_position_matches_loosely() {
        let items = rows(json!([{ "id": 1 }, { "id": "2" }]));
        assert_eq!(position(&items, "id", &json!("1")), Some(0));
        assert_eq!(position(&items, "id", &json!(2)), Some(1));
        assert_eq!(position(&items, "id", &json!(3)), None);
    }
}
