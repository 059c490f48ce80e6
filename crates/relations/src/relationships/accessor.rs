//! Relation accessors
//!
//! A [`RelationAccessor`] binds one relation to one owning record. It returns
//! the cached value when the relation was already resolved, fetches it
//! (scoped to the owner) otherwise, and exposes the write operations that make
//! sense for the relation kind. Embedded and referencesMany operations live in
//! [`super::embedded`].

use std::slice;
use std::sync::Arc;

use serde_json::Value;

use crate::connector::Collection;
use crate::datasource::DataSource;
use crate::error::{ModelError, ModelResult};
use crate::filter::{Filter, QueryOptions, Row};
use crate::record::Record;
use super::cache::RelationValue;
use super::eager_loading::IncludeResolver;
use super::include::IncludeNode;
use super::metadata::{RelationDefinition, RelationType};
use super::scope::ScopeComposer;

/// Accessor for one relation of one record
pub struct RelationAccessor<'a> {
    pub(crate) source: &'a DataSource,
    pub(crate) relation: Arc<RelationDefinition>,
    pub(crate) owner: &'a mut Record,
}

impl<'a> RelationAccessor<'a> {
    pub fn new(source: &'a DataSource, relation: Arc<RelationDefinition>, owner: &'a mut Record) -> Self {
        Self {
            source,
            relation,
            owner,
        }
    }

    pub fn definition(&self) -> &RelationDefinition {
        &self.relation
    }

    pub fn owner(&self) -> &Record {
        self.owner
    }

    /// Cached value, without fetching
    pub fn cached(&self) -> Option<&RelationValue> {
        self.owner.relation(&self.relation.name)
    }

    /// Cached value, or one scoped fetch that populates the cache
    pub async fn get(&mut self) -> ModelResult<RelationValue> {
        if let Some(value) = self.cached() {
            return Ok(value.clone());
        }
        self.refresh().await
    }

    /// Fetch again, replacing the cached value
    pub async fn refresh(&mut self) -> ModelResult<RelationValue> {
        let value = self.load(None).await?;
        self.owner.set_relation(&self.relation.name, value.clone());
        Ok(value)
    }

    /// Query related records with an extra filter; the cache is left untouched
    pub async fn find(&self, filter: &Filter) -> ModelResult<Vec<Record>> {
        let value = self.load(Some(filter)).await?;
        Ok(into_records(value))
    }

    /// Load the relation for the owner, applying the instance scope
    pub(crate) async fn load(&self, caller: Option<&Filter>) -> ModelResult<RelationValue> {
        if matches!(
            self.relation.kind,
            RelationType::HasMany | RelationType::HasOne | RelationType::HasManyThrough | RelationType::HasAndBelongsToMany
        ) {
            self.owner_key()?;
        }

        let mut scope = caller.cloned().unwrap_or_default();
        let properties = ScopeComposer::new(&self.relation).properties_for(self.owner);
        if !properties.is_empty() {
            scope = scope.and_where(properties);
        }
        let node = IncludeNode {
            relation: self.relation.name.clone(),
            scope: if scope.is_empty() { None } else { Some(scope) },
            include: None,
        };

        let options = QueryOptions::new();
        let mut values = IncludeResolver::new(self.source, &options)
            .load_relation(&self.relation, slice::from_ref(&*self.owner), &node, 1)
            .await?;
        Ok(values
            .pop()
            .unwrap_or_else(|| RelationValue::empty(self.relation.multiple)))
    }

    pub(crate) fn ensure_kind(&self, allowed: &[RelationType], operation: &str) -> ModelResult<()> {
        if allowed.contains(&self.relation.kind) {
            Ok(())
        } else {
            Err(ModelError::Relationship(format!(
                "Operation '{}' is not supported by {} relation '{}'",
                operation, self.relation.kind, self.relation.name
            )))
        }
    }

    /// Join key value on the owner (the primary key for hasMany-style relations)
    pub(crate) fn owner_key(&self) -> ModelResult<Value> {
        self.owner
            .get(&self.relation.key_from)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or(ModelError::MissingPrimaryKey)
    }

    pub(crate) fn target_collection(&self) -> ModelResult<Collection> {
        self.source.collection(self.relation.target_model()?)
    }

    fn through_collection(&self) -> ModelResult<(Collection, String)> {
        let through = self.relation.through.as_ref().ok_or_else(|| {
            ModelError::Relationship(format!("Relation '{}' has no through model", self.relation.name))
        })?;
        Ok((self.source.collection(&through.model)?, through.key_through.clone()))
    }

    /// Key on the target the through model's collect relation points at
    fn through_target_key(&self, target: &Collection) -> ModelResult<String> {
        let through = match &self.relation.through {
            Some(through) => through,
            None => return Ok(target.id_property.clone()),
        };
        Ok(match self.source.relation(&through.model, &through.collect)? {
            Some(collect) if collect.kind == RelationType::BelongsTo => collect.key_to.clone(),
            _ => target.id_property.clone(),
        })
    }

    /// Filter selecting this owner's children in the target collection
    fn instance_filter(&self, caller: Option<&Filter>) -> ModelResult<Filter> {
        let key = self.owner_key()?;
        Ok(ScopeComposer::new(&self.relation)
            .for_instance(self.owner, caller)
            .where_eq(&self.relation.key_to, key))
    }

    /// Build an unsaved child carrying the foreign key and stamped properties
    pub fn build(&self, attributes: Row) -> ModelResult<Record> {
        if self.relation.kind.is_embedded() {
            return self.build_embedded(attributes);
        }
        self.ensure_kind(
            &[
                RelationType::HasMany,
                RelationType::HasOne,
                RelationType::HasManyThrough,
                RelationType::HasAndBelongsToMany,
                RelationType::BelongsTo,
            ],
            "build",
        )?;
        let collection = self.target_collection()?;
        let mut data = attributes;
        data.extend(ScopeComposer::new(&self.relation).stamped_fields(self.owner));
        if self.relation.kind.target_holds_key() {
            data.insert(self.relation.key_to.clone(), self.owner_key()?);
        }
        Ok(Record::new(&collection.name, data).with_id_property(&collection.id_property))
    }

    /// Create a related record.
    ///
    /// hasMany/hasOne children get the owner's key; hasOne fails when a child
    /// already exists. Through relations also create the join row. belongsTo
    /// stores the new target's key on the owner (persisted if the owner is).
    pub async fn create(&mut self, attributes: Row) -> ModelResult<Record> {
        match self.relation.kind {
            RelationType::HasMany => self.create_child(attributes).await,
            RelationType::HasOne => {
                let filter = self.instance_filter(None)?;
                let collection = self.target_collection()?;
                let existing = self
                    .source
                    .connector()
                    .count(&collection, filter.where_clause.as_ref(), &QueryOptions::new())
                    .await?;
                if existing > 0 {
                    return Err(ModelError::Validation(format!(
                        "'{}' of '{}' already exists",
                        self.relation.name,
                        self.relation.model_from
                    )));
                }
                self.create_child(attributes).await
            }
            RelationType::HasManyThrough | RelationType::HasAndBelongsToMany => {
                let target = self.create_child(attributes).await?;
                self.add(&target, Row::new()).await?;
                Ok(target)
            }
            RelationType::BelongsTo => {
                let target = self.create_child(attributes).await?;
                let key = target.get(&self.relation.key_to).cloned().unwrap_or(Value::Null);
                let mut fields = Row::new();
                fields.insert(self.relation.key_from.clone(), key.clone());
                self.owner.set(&self.relation.key_from, key);
                self.source.update_fields(self.owner, fields).await?;
                Ok(target)
            }
            _ => self.create_embedded_or_referenced(attributes).await,
        }
    }

    async fn create_child(&self, attributes: Row) -> ModelResult<Record> {
        let built = self.build(attributes)?;
        let model = built.model().to_string();
        self.source.create(&model, built.into_data()).await
    }

    /// Find a related record by id within this relation's scope
    pub async fn find_by_id(&self, id: &Value) -> ModelResult<Record> {
        if self.relation.kind.is_embedded() || self.relation.kind == RelationType::ReferencesMany {
            return self.find_by_id_local(id).await;
        }
        let collection = self.target_collection()?;
        let filter = Filter::new().where_eq(&collection.id_property, id.clone()).limit(1);
        self.find(&filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::NotFound(collection.name.clone()))
    }

    /// Whether a related record with this id exists within the relation
    pub async fn exists(&self, id: &Value) -> ModelResult<bool> {
        match self.find_by_id(id).await {
            Ok(_) => Ok(true),
            Err(ModelError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Count related records, optionally narrowed by `where_clause`
    pub async fn count(&self, where_clause: Option<Row>) -> ModelResult<usize> {
        match self.relation.kind {
            RelationType::HasMany | RelationType::HasOne => {
                let caller = where_clause.map(|w| Filter::new().and_where(w));
                let filter = self.instance_filter(caller.as_ref())?;
                let collection = self.target_collection()?;
                self.source
                    .connector()
                    .count(&collection, filter.where_clause.as_ref(), &QueryOptions::new())
                    .await
            }
            RelationType::EmbedsMany | RelationType::EmbedsOne | RelationType::ReferencesMany => {
                self.count_local()
            }
            _ => {
                let caller = where_clause.map(|w| Filter::new().and_where(w));
                Ok(into_records(self.load(caller.as_ref()).await?).len())
            }
        }
    }

    /// Update a related record by id; fails with `NotFound` outside the relation
    pub async fn update_by_id(&mut self, id: &Value, data: Row) -> ModelResult<Record> {
        if self.relation.kind.is_embedded() {
            return self.update_embedded_by_id(id, data).await;
        }
        let existing = self.find_by_id(id).await?;
        let collection = self.target_collection()?;
        let row = self
            .source
            .connector()
            .update_attributes(&collection, existing.require_id()?, data, &QueryOptions::new())
            .await?;
        Ok(Record::persisted(&collection.name, &collection.id_property, row))
    }

    /// Delete a related record by id; through relations also drop the join row
    pub async fn destroy_by_id(&mut self, id: &Value) -> ModelResult<bool> {
        if self.relation.kind.is_embedded() {
            return self.destroy_embedded_by_id(id).await;
        }
        let existing = self.find_by_id(id).await?;
        if self.relation.kind.uses_through() {
            self.remove(&existing).await?;
        }
        let collection = self.target_collection()?;
        self.source
            .connector()
            .destroy(&collection, existing.require_id()?, &QueryOptions::new())
            .await
    }

    /// Delete every related record matching `where_clause`
    pub async fn destroy_all(&mut self, where_clause: Option<Row>) -> ModelResult<usize> {
        self.ensure_kind(
            &[
                RelationType::HasMany,
                RelationType::HasOne,
                RelationType::HasManyThrough,
                RelationType::HasAndBelongsToMany,
            ],
            "destroy_all",
        )?;
        let caller = where_clause.map(|w| Filter::new().and_where(w));
        let collection = self.target_collection()?;

        if self.relation.kind.uses_through() {
            let targets = into_records(self.load(caller.as_ref()).await?);
            let mut removed = 0;
            for target in &targets {
                self.remove(target).await?;
                if self
                    .source
                    .connector()
                    .destroy(&collection, target.require_id()?, &QueryOptions::new())
                    .await?
                {
                    removed += 1;
                }
            }
            return Ok(removed);
        }

        let filter = self.instance_filter(caller.as_ref())?;
        self.source
            .connector()
            .destroy_all(&collection, filter.where_clause.as_ref(), &QueryOptions::new())
            .await
    }

    /// Link `target` through a new join row carrying `through_attributes`
    pub async fn add(&mut self, target: &Record, through_attributes: Row) -> ModelResult<Record> {
        if self.relation.kind == RelationType::ReferencesMany {
            return self.add_reference(target).await;
        }
        self.ensure_kind(&[RelationType::HasManyThrough, RelationType::HasAndBelongsToMany], "add")?;
        let owner_key = self.owner_key()?;
        let (through, key_through) = self.through_collection()?;
        let target_key = self.through_target_key(&self.target_collection()?)?;
        let target_value = target
            .get(&target_key)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or(ModelError::MissingPrimaryKey)?;

        let mut data = through_attributes;
        data.insert(self.relation.key_to.clone(), owner_key);
        data.insert(key_through, target_value);
        self.source.create(&through.name, data).await
    }

    /// Remove the join rows linking the owner to `target`
    pub async fn remove(&mut self, target: &Record) -> ModelResult<usize> {
        if self.relation.kind == RelationType::ReferencesMany {
            let id = target.require_id()?.clone();
            return self.remove_reference(&id).await.map(usize::from);
        }
        self.ensure_kind(&[RelationType::HasManyThrough, RelationType::HasAndBelongsToMany], "remove")?;
        let owner_key = self.owner_key()?;
        let (through, key_through) = self.through_collection()?;
        let target_key = self.through_target_key(&self.target_collection()?)?;
        let target_value = target
            .get(&target_key)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or(ModelError::MissingPrimaryKey)?;

        let mut clause = Row::new();
        clause.insert(self.relation.key_to.clone(), owner_key);
        clause.insert(key_through, target_value);
        self.source
            .connector()
            .destroy_all(&through, Some(&clause), &QueryOptions::new())
            .await
    }

    /// Update the single related record (belongsTo, hasOne, embedsOne)
    pub async fn update(&mut self, data: Row) -> ModelResult<Record> {
        if self.relation.kind == RelationType::EmbedsOne {
            return self.update_embedded_one(data).await;
        }
        self.ensure_kind(&[RelationType::BelongsTo, RelationType::HasOne], "update")?;
        let current = self
            .load(None)
            .await?
            .as_one()
            .cloned()
            .ok_or_else(|| ModelError::NotFound(self.relation.model_to.clone().unwrap_or_default()))?;
        let collection = self.source.collection(current.model())?;
        let row = self
            .source
            .connector()
            .update_attributes(&collection, current.require_id()?, data, &QueryOptions::new())
            .await?;
        let updated = Record::persisted(&collection.name, &collection.id_property, row);
        self.owner
            .set_relation(&self.relation.name, RelationValue::one(Some(updated.clone())));
        Ok(updated)
    }

    /// Delete the single related record (belongsTo, hasOne, embedsOne).
    ///
    /// A belongsTo owner loses its foreign key (persisted if the owner is).
    pub async fn destroy(&mut self) -> ModelResult<bool> {
        if self.relation.kind == RelationType::EmbedsOne {
            return self.destroy_embedded_one().await;
        }
        self.ensure_kind(&[RelationType::BelongsTo, RelationType::HasOne], "destroy")?;
        let current = match self.load(None).await?.as_one().cloned() {
            Some(current) => current,
            None => return Ok(false),
        };
        let collection = self.source.collection(current.model())?;
        let removed = self
            .source
            .connector()
            .destroy(&collection, current.require_id()?, &QueryOptions::new())
            .await?;

        if self.relation.kind == RelationType::BelongsTo {
            let mut fields = Row::new();
            fields.insert(self.relation.key_from.clone(), Value::Null);
            if let Some(polymorphic) = &self.relation.polymorphic {
                fields.insert(polymorphic.discriminator.clone(), Value::Null);
            }
            self.owner.apply(&fields);
            self.source.update_fields(self.owner, fields).await?;
        }
        self.owner.relations_mut().invalidate(&self.relation.name);
        Ok(removed)
    }

    /// Point the relation at `target` (or at nothing) without persisting.
    ///
    /// belongsTo writes the foreign key (and discriminator when polymorphic)
    /// on the owner; hasOne writes the owner's key onto the target. The cache
    /// holds the assigned value afterwards.
    pub fn assign(&mut self, target: Option<Record>) -> ModelResult<()> {
        self.ensure_kind(&[RelationType::BelongsTo, RelationType::HasOne], "assign")?;
        let target = match (self.relation.kind, target) {
            (RelationType::BelongsTo, target) => {
                let key_to = match (&self.relation.polymorphic, &target) {
                    (Some(_), Some(t)) => t.id_property().to_string(),
                    _ => self.relation.key_to.clone(),
                };
                let key = target
                    .as_ref()
                    .and_then(|t| t.get(&key_to).cloned())
                    .unwrap_or(Value::Null);
                self.owner.set(&self.relation.key_from, key);
                if let Some(polymorphic) = &self.relation.polymorphic {
                    let discriminator = target
                        .as_ref()
                        .map(|t| Value::String(t.model().to_string()))
                        .unwrap_or(Value::Null);
                    self.owner.set(&polymorphic.discriminator, discriminator);
                }
                target
            }
            (_, Some(mut target)) => {
                target.set(&self.relation.key_to, self.owner_key()?);
                target.apply(&ScopeComposer::new(&self.relation).stamped_fields(self.owner));
                Some(target)
            }
            (_, None) => None,
        };
        self.owner.set_relation(&self.relation.name, RelationValue::one(target));
        Ok(())
    }
}

pub(crate) fn into_records(value: RelationValue) -> Vec<Record> {
    match value {
        RelationValue::Many(records) => records,
        RelationValue::One(record) => record.map(|r| *r).into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_records() {
        let record = Record::new("Post", Row::new());
        assert_eq!(into_records(RelationValue::one(Some(record.clone()))), vec![record.clone()]);
        assert!(into_records(RelationValue::one(None)).is_empty());
        assert_eq!(into_records(RelationValue::many(vec![record.clone(), record])).len(), 2);
    }
}
