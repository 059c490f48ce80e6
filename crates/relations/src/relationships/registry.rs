//! Relationship Registry - model definitions and relation binding
//!
//! Model names are interned to [`ModelId`] handles the first time they are
//! mentioned, whether by a model definition or by a relation pointing at a
//! model that does not exist yet. A relation whose models are not all defined
//! is stored as a pending slot; every model or relation registration re-scans
//! pending slots and binds whatever became resolvable.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::connector::Collection;
use crate::error::{ModelError, ModelResult, RelationshipError};
use crate::record::DEFAULT_ID_PROPERTY;
use super::inference::{self, ForeignKeyConvention};
use super::metadata::{
    PolymorphicConfig, RelationDefinition, RelationParams, RelationType, ThroughConfig,
};

/// Stable handle for an interned model name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(usize);

impl ModelId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Declared type of a model property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Number,
    String,
    Boolean,
    Object,
    Array,
    Any,
}

/// Definition of a model: its primary key and declared properties
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDefinition {
    pub name: String,
    pub id_property: String,
    pub id_type: PropertyType,
    pub properties: BTreeMap<String, PropertyType>,
}

impl ModelDefinition {
    /// A model with a numeric `id` primary key
    pub fn new(name: &str) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(DEFAULT_ID_PROPERTY.to_string(), PropertyType::Number);
        Self {
            name: name.to_string(),
            id_property: DEFAULT_ID_PROPERTY.to_string(),
            id_type: PropertyType::Number,
            properties,
        }
    }

    /// Use a different primary key property and type
    pub fn id_property(mut self, name: &str, id_type: PropertyType) -> Self {
        if self.id_property == DEFAULT_ID_PROPERTY && name != DEFAULT_ID_PROPERTY {
            self.properties.remove(DEFAULT_ID_PROPERTY);
        }
        self.id_property = name.to_string();
        self.id_type = id_type;
        self.properties.insert(name.to_string(), id_type);
        self
    }

    /// Declare a property
    pub fn property(mut self, name: &str, property_type: PropertyType) -> Self {
        self.properties.insert(name.to_string(), property_type);
        self
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn property_type(&self, name: &str) -> Option<PropertyType> {
        self.properties.get(name).copied()
    }

    /// Add a property unless already declared; returns true if added
    pub(crate) fn inject_property(&mut self, name: &str, property_type: PropertyType) -> bool {
        if self.properties.contains_key(name) {
            return false;
        }
        self.properties.insert(name.to_string(), property_type);
        true
    }

    /// Parse a model from its JSON form:
    /// `{"properties": {"isbn": {"type": "string", "id": true}, "title": "string"}}`
    pub fn from_value(name: &str, value: &Value) -> ModelResult<Self> {
        let mut model = ModelDefinition::new(name);
        let properties = match value.get("properties") {
            None | Some(Value::Null) => return Ok(model),
            Some(Value::Object(props)) => props,
            Some(_) => {
                return Err(ModelError::Configuration(format!(
                    "Properties of model '{}' must be an object",
                    name
                )))
            }
        };

        for (prop, spec) in properties {
            let (type_value, is_id) = match spec {
                Value::Object(obj) => (
                    obj.get("type").cloned().unwrap_or(Value::String("any".to_string())),
                    obj.get("id").and_then(Value::as_bool).unwrap_or(false),
                ),
                other => (other.clone(), false),
            };
            let property_type: PropertyType = serde_json::from_value(type_value).map_err(|e| {
                ModelError::Configuration(format!(
                    "Invalid type for property '{}.{}': {}",
                    name, prop, e
                ))
            })?;
            model = if is_id {
                model.id_property(prop, property_type)
            } else {
                model.property(prop, property_type)
            };
        }

        Ok(model)
    }
}

/// State of one declared relation
#[derive(Debug, Clone)]
enum RelationSlot {
    Bound {
        params: RelationParams,
        definition: Arc<RelationDefinition>,
    },
    Pending {
        params: RelationParams,
        missing: ModelId,
    },
}

impl RelationSlot {
    fn params(&self) -> &RelationParams {
        match self {
            RelationSlot::Bound { params, .. } | RelationSlot::Pending { params, .. } => params,
        }
    }
}

#[derive(Debug, Clone)]
struct ModelSlot {
    name: String,
    definition: Option<ModelDefinition>,
    /// Properties added by relations rather than declared
    injected: BTreeSet<String>,
    /// Relations in declaration order
    relations: Vec<(String, RelationSlot)>,
}

/// Whether a declared relation could be bound right away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationStatus {
    Bound,
    /// Waiting for the named model to be defined
    Pending(String),
}

enum Binding {
    Bound(RelationDefinition),
    Missing(ModelId),
}

/// Registry of models and their relations
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    names: HashMap<String, ModelId>,
    slots: Vec<ModelSlot>,
    convention: ForeignKeyConvention,
}

impl ModelRegistry {
    /// Create an empty registry using camelCase foreign keys
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different foreign key naming convention
    pub fn with_convention(mut self, convention: ForeignKeyConvention) -> Self {
        self.convention = convention;
        self
    }

    pub fn convention(&self) -> &ForeignKeyConvention {
        &self.convention
    }

    /// Intern a model name, returning its stable handle
    pub fn intern(&mut self, name: &str) -> ModelId {
        if let Some(id) = self.names.get(name) {
            return *id;
        }
        let id = ModelId(self.slots.len());
        self.slots.push(ModelSlot {
            name: name.to_string(),
            definition: None,
            injected: BTreeSet::new(),
            relations: Vec::new(),
        });
        self.names.insert(name.to_string(), id);
        id
    }

    pub fn model_id(&self, name: &str) -> Option<ModelId> {
        self.names.get(name).copied()
    }

    pub fn model_name(&self, id: ModelId) -> Option<&str> {
        self.slots.get(id.0).map(|slot| slot.name.as_str())
    }

    /// Definition of a model, if it has been defined
    pub fn model(&self, name: &str) -> Option<&ModelDefinition> {
        self.model_id(name)
            .and_then(|id| self.slots[id.0].definition.as_ref())
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.model(name).is_some()
    }

    /// Names of defined models, in registration order
    pub fn model_names(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|slot| slot.definition.is_some())
            .map(|slot| slot.name.as_str())
            .collect()
    }

    /// Storage descriptor for a defined model
    pub fn collection(&self, name: &str) -> ModelResult<Collection> {
        let model = self
            .model(name)
            .ok_or_else(|| ModelError::Configuration(format!("Model '{}' is not defined", name)))?;
        Ok(Collection::new(&model.name, &model.id_property, model.id_type))
    }

    /// Define (or redefine) a model and bind any relations waiting for it.
    ///
    /// Redefinition keeps the model's relations and the properties they injected.
    pub fn define_model(&mut self, definition: ModelDefinition) -> ModelResult<ModelId> {
        let id = self.intern(&definition.name);
        let slot = &mut self.slots[id.0];
        slot.injected.retain(|prop| !definition.properties.contains_key(prop));
        let merged = match slot.definition.take() {
            Some(previous) => {
                let mut next = definition;
                for (prop, ty) in previous.properties {
                    if prop != previous.id_property || prop == next.id_property {
                        next.properties.entry(prop).or_insert(ty);
                    }
                }
                next
            }
            None => definition,
        };
        debug!("Defined model '{}'", merged.name);
        slot.definition = Some(merged);

        self.resolve_pending()?;
        Ok(id)
    }

    /// Declare a relation on `model`.
    ///
    /// A missing or unknown relation type fails immediately. A relation whose
    /// models are not all defined yet is kept pending and bound later.
    pub fn define_relation(
        &mut self,
        model: &str,
        name: &str,
        params: RelationParams,
    ) -> ModelResult<RelationStatus> {
        let kind = params.relation_type(name)?;
        if params.model.is_none() && !(kind == RelationType::BelongsTo && params.polymorphic.is_some()) {
            return Err(RelationshipError::InvalidConfiguration(format!(
                "Relation '{}' on '{}' requires a target model",
                name, model
            ))
            .into());
        }

        let from = self.intern(model);
        let slot = match self.try_bind(from, name, &params)? {
            Binding::Bound(definition) => RelationSlot::Bound {
                params,
                definition: Arc::new(definition),
            },
            Binding::Missing(missing) => {
                debug!(
                    "Relation '{}' on '{}' is pending until '{}' is defined",
                    name,
                    model,
                    self.slots[missing.0].name
                );
                RelationSlot::Pending { params, missing }
            }
        };
        self.store_relation(from, name, slot);

        self.resolve_pending()?;
        self.relation_status(model, name)
    }

    fn relation_status(&self, model: &str, name: &str) -> ModelResult<RelationStatus> {
        match self.find_slot(model, name) {
            Some(RelationSlot::Bound { .. }) => Ok(RelationStatus::Bound),
            Some(RelationSlot::Pending { missing, .. }) => {
                Ok(RelationStatus::Pending(self.slots[missing.0].name.clone()))
            }
            None => Err(RelationshipError::NotFound(format!("{}.{}", model, name)).into()),
        }
    }

    fn store_relation(&mut self, from: ModelId, name: &str, slot: RelationSlot) {
        let relations = &mut self.slots[from.0].relations;
        match relations.iter_mut().find(|(existing, _)| existing == name) {
            Some(entry) => entry.1 = slot,
            None => relations.push((name.to_string(), slot)),
        }
    }

    fn find_slot(&self, model: &str, name: &str) -> Option<&RelationSlot> {
        let id = self.model_id(model)?;
        self.slots[id.0]
            .relations
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, slot)| slot)
    }

    /// Look up a relation.
    ///
    /// `Ok(None)` when the model has no relation of that name; an error when
    /// the relation exists but is still waiting for a model definition.
    pub fn relation(&self, model: &str, name: &str) -> ModelResult<Option<Arc<RelationDefinition>>> {
        match self.find_slot(model, name) {
            None => Ok(None),
            Some(RelationSlot::Bound { definition, .. }) => Ok(Some(definition.clone())),
            Some(RelationSlot::Pending { missing, .. }) => Err(RelationshipError::Unbound {
                model: model.to_string(),
                relation: name.to_string(),
                missing: self.slots[missing.0].name.clone(),
            }
            .into()),
        }
    }

    /// Bound relations of a model, in declaration order
    pub fn relations(&self, model: &str) -> Vec<Arc<RelationDefinition>> {
        self.model_id(model)
            .map(|id| {
                self.slots[id.0]
                    .relations
                    .iter()
                    .filter_map(|(_, slot)| match slot {
                        RelationSlot::Bound { definition, .. } => Some(definition.clone()),
                        RelationSlot::Pending { .. } => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pending relations as `(model, relation, missing model)`
    pub fn pending(&self) -> Vec<(String, String, String)> {
        let mut out = Vec::new();
        for slot in &self.slots {
            for (name, relation) in &slot.relations {
                if let RelationSlot::Pending { missing, .. } = relation {
                    out.push((slot.name.clone(), name.clone(), self.slots[missing.0].name.clone()));
                }
            }
        }
        out
    }

    /// Bind pending relations until no more progress is made, then refresh
    /// through-relation collect keys
    fn resolve_pending(&mut self) -> ModelResult<usize> {
        let mut bound = 0;
        loop {
            let mut progressed = false;
            for model_index in 0..self.slots.len() {
                for relation_index in 0..self.slots[model_index].relations.len() {
                    let (name, params) = match &self.slots[model_index].relations[relation_index] {
                        (name, RelationSlot::Pending { params, .. }) => (name.clone(), params.clone()),
                        _ => continue,
                    };
                    let next = match self.try_bind(ModelId(model_index), &name, &params)? {
                        Binding::Bound(definition) => {
                            debug!(
                                "Bound pending relation '{}' on '{}'",
                                name, self.slots[model_index].name
                            );
                            progressed = true;
                            bound += 1;
                            RelationSlot::Bound {
                                params,
                                definition: Arc::new(definition),
                            }
                        }
                        Binding::Missing(missing) => RelationSlot::Pending { params, missing },
                    };
                    // binding may have auto-defined a join model, so index again
                    self.slots[model_index].relations[relation_index].1 = next;
                }
            }
            if !progressed {
                break;
            }
        }
        self.refresh_through_relations();
        Ok(bound)
    }

    /// Re-resolve collect keys of bound through relations against the
    /// current belongsTo relations of their through models
    fn refresh_through_relations(&mut self) {
        let mut updates = Vec::new();
        for (model_index, slot) in self.slots.iter().enumerate() {
            for (relation_index, (_, relation)) in slot.relations.iter().enumerate() {
                let (params, definition) = match relation {
                    RelationSlot::Bound { params, definition } => (params, definition),
                    RelationSlot::Pending { .. } => continue,
                };
                let through = match &definition.through {
                    Some(through) => through,
                    None => continue,
                };
                let model_to = match definition.model_to.as_deref() {
                    Some(model_to) => model_to,
                    None => continue,
                };
                let next = self.through_config(&through.model, model_to, params);
                if &next != through {
                    let stale_key = through.key_through.clone();
                    let mut updated = (**definition).clone();
                    updated.through = Some(next);
                    updates.push((model_index, relation_index, updated, stale_key));
                }
            }
        }

        let mut rekeyed = Vec::new();
        for (model_index, relation_index, definition, stale_key) in updates {
            let through = match &definition.through {
                Some(through) => through.clone(),
                None => continue,
            };
            if let RelationSlot::Bound { definition: slot, .. } =
                &mut self.slots[model_index].relations[relation_index].1
            {
                debug!(
                    "Collect key of '{}' on '{}' resolved to '{}'",
                    definition.name, definition.model_from, through.collect
                );
                if through.key_through != stale_key {
                    rekeyed.push((through, definition.model_to.clone(), stale_key));
                }
                *slot = Arc::new(definition);
            }
        }

        for (through, model_to, stale_key) in rekeyed {
            let id_type = model_to
                .as_deref()
                .and_then(|name| self.model(name))
                .map(|target| target.id_type)
                .unwrap_or(PropertyType::Any);
            self.inject(&through.model, &through.key_through, id_type);
            if !self.property_in_use(&through.model, &stale_key) {
                self.remove_injected(&through.model, &stale_key);
            }
        }
    }

    /// Whether any bound relation reads or writes `property` on `model`
    fn property_in_use(&self, model: &str, property: &str) -> bool {
        self.slots.iter().flat_map(|slot| slot.relations.iter()).any(|(_, relation)| {
            let definition = match relation {
                RelationSlot::Bound { definition, .. } => definition,
                RelationSlot::Pending { .. } => return false,
            };
            if let Some(through) = &definition.through {
                return through.model == model
                    && (definition.key_to == property || through.key_through == property);
            }
            (definition.model_from == model && definition.key_from == property)
                || (definition.model_to.as_deref() == Some(model) && definition.key_to == property)
        })
    }

    fn remove_injected(&mut self, model: &str, property: &str) {
        let id = match self.model_id(model) {
            Some(id) => id,
            None => return,
        };
        let slot = &mut self.slots[id.0];
        if !slot.injected.remove(property) {
            return;
        }
        if let Some(definition) = slot.definition.as_mut() {
            definition.properties.remove(property);
            debug!("Removed stale property '{}' from '{}'", property, model);
        }
    }

    fn through_config(&self, through_model: &str, model_to: &str, params: &RelationParams) -> ThroughConfig {
        let explicit = params.key_through.is_some();
        let key_through = params
            .key_through
            .clone()
            .unwrap_or_else(|| self.convention.foreign_key_for(model_to));
        let through_relations = self.relations(through_model);
        let resolved = inference::resolve_collect(
            through_relations.iter().map(|rel| rel.as_ref()),
            model_to,
            &key_through,
            explicit,
        );
        ThroughConfig {
            model: through_model.to_string(),
            key_through: resolved.key_through,
            collect: resolved.collect,
            collect_source: resolved.source,
            explicit_key_through: explicit,
        }
    }

    fn defined(&self, id: ModelId) -> Option<&ModelDefinition> {
        self.slots[id.0].definition.as_ref()
    }

    fn definition_or_missing(&self, id: ModelId) -> Result<ModelDefinition, ModelId> {
        self.defined(id).cloned().ok_or(id)
    }

    fn inject(&mut self, model: &str, property: &str, property_type: PropertyType) {
        let id = self.intern(model);
        let slot = &mut self.slots[id.0];
        if let Some(definition) = slot.definition.as_mut() {
            if definition.inject_property(property, property_type) {
                slot.injected.insert(property.to_string());
                debug!("Injected property '{}' on '{}'", property, model);
            }
        }
    }

    /// Derive a relation definition, or report the first missing model
    fn try_bind(&mut self, from: ModelId, name: &str, params: &RelationParams) -> ModelResult<Binding> {
        let kind = params.relation_type(name)?;
        let source = match self.definition_or_missing(from) {
            Ok(source) => source,
            Err(missing) => return Ok(Binding::Missing(missing)),
        };

        if kind == RelationType::BelongsTo && params.polymorphic.is_some() {
            return Ok(Binding::Bound(self.bind_polymorphic_belongs_to(&source, name, params)));
        }

        let target_name = params.model.clone().ok_or_else(|| {
            ModelError::Configuration(format!(
                "Relation '{}' on '{}' requires a target model",
                name, source.name
            ))
        })?;
        let to = self.intern(&target_name);
        let target = match self.definition_or_missing(to) {
            Ok(target) => target,
            Err(missing) => return Ok(Binding::Missing(missing)),
        };

        let mut definition = RelationDefinition {
            name: name.to_string(),
            kind,
            model_from: source.name.clone(),
            model_to: Some(target.name.clone()),
            key_from: String::new(),
            key_to: String::new(),
            multiple: kind.is_multiple(),
            polymorphic: None,
            through: None,
            scope: params.scope.clone(),
            properties: params.properties.clone(),
            options: params.options.clone(),
        };

        match kind {
            RelationType::BelongsTo => {
                definition.key_from = params
                    .foreign_key
                    .clone()
                    .unwrap_or_else(|| self.convention.relation_key(name));
                definition.key_to = params.primary_key.clone().unwrap_or_else(|| target.id_property.clone());
                self.inject(&source.name, &definition.key_from, target.id_type);
            }
            RelationType::HasMany | RelationType::HasOne => {
                definition.key_from = params.primary_key.clone().unwrap_or_else(|| source.id_property.clone());
                match &params.polymorphic {
                    Some(polymorphic) => {
                        let config = self.polymorphic_config(name, &source.name, polymorphic)?;
                        definition.key_to = params.foreign_key.clone().unwrap_or_else(|| config.foreign_key.clone());
                        self.inject(&target.name, &config.discriminator, PropertyType::String);
                        definition.polymorphic = Some(PolymorphicConfig {
                            discriminator: config.discriminator,
                            foreign_key: definition.key_to.clone(),
                        });
                    }
                    None => {
                        definition.key_to = params
                            .foreign_key
                            .clone()
                            .unwrap_or_else(|| self.convention.foreign_key_for(&source.name));
                    }
                }
                self.inject(&target.name, &definition.key_to, source.id_type);
            }
            RelationType::HasManyThrough | RelationType::HasAndBelongsToMany => {
                let through_name = match params.through.clone() {
                    Some(through) => through,
                    None if kind == RelationType::HasAndBelongsToMany => {
                        self.join_model_for(&source, &target)?
                    }
                    None => {
                        return Err(RelationshipError::InvalidConfiguration(format!(
                            "Relation '{}' on '{}' requires a through model",
                            name, source.name
                        ))
                        .into())
                    }
                };
                let through_id = self.intern(&through_name);
                if self.defined(through_id).is_none() {
                    return Ok(Binding::Missing(through_id));
                }

                definition.key_from = params.primary_key.clone().unwrap_or_else(|| source.id_property.clone());
                definition.key_to = params
                    .foreign_key
                    .clone()
                    .unwrap_or_else(|| self.convention.foreign_key_for(&source.name));
                let through = self.through_config(&through_name, &target.name, params);
                self.inject(&through_name, &definition.key_to, source.id_type);
                self.inject(&through_name, &through.key_through, target.id_type);
                definition.through = Some(through);
            }
            RelationType::ReferencesMany => {
                definition.key_from = params
                    .options
                    .property
                    .clone()
                    .or_else(|| params.foreign_key.clone())
                    .unwrap_or_else(|| inference::references_many_property(&target.name));
                definition.key_to = params.primary_key.clone().unwrap_or_else(|| target.id_property.clone());
                self.inject(&source.name, &definition.key_from, PropertyType::Array);
            }
            RelationType::EmbedsOne | RelationType::EmbedsMany => {
                let (default_property, property_type) = if kind == RelationType::EmbedsOne {
                    (inference::embeds_one_property(&target.name), PropertyType::Object)
                } else {
                    (inference::embeds_many_property(&target.name), PropertyType::Array)
                };
                definition.key_from = params.options.property.clone().unwrap_or(default_property);
                definition.key_to = params.primary_key.clone().unwrap_or_else(|| target.id_property.clone());
                self.inject(&source.name, &definition.key_from, property_type);
            }
        }

        Ok(Binding::Bound(definition))
    }

    fn bind_polymorphic_belongs_to(
        &mut self,
        source: &ModelDefinition,
        name: &str,
        params: &RelationParams,
    ) -> RelationDefinition {
        let polymorphic = params.polymorphic.clone().unwrap_or_default();
        let base = polymorphic.name.clone().unwrap_or_else(|| name.to_string());
        let discriminator = polymorphic
            .discriminator
            .clone()
            .unwrap_or_else(|| self.convention.discriminator_for(&base));
        let foreign_key = params
            .foreign_key
            .clone()
            .or(polymorphic.foreign_key)
            .unwrap_or_else(|| self.convention.relation_key(&base));

        self.inject(&source.name, &foreign_key, PropertyType::Any);
        self.inject(&source.name, &discriminator, PropertyType::String);

        RelationDefinition {
            name: name.to_string(),
            kind: RelationType::BelongsTo,
            model_from: source.name.clone(),
            model_to: None,
            key_from: foreign_key.clone(),
            key_to: params
                .primary_key
                .clone()
                .unwrap_or_else(|| DEFAULT_ID_PROPERTY.to_string()),
            multiple: false,
            polymorphic: Some(PolymorphicConfig {
                discriminator,
                foreign_key,
            }),
            through: None,
            scope: params.scope.clone(),
            properties: params.properties.clone(),
            options: params.options.clone(),
        }
    }

    fn polymorphic_config(
        &self,
        name: &str,
        model: &str,
        polymorphic: &super::metadata::PolymorphicParams,
    ) -> ModelResult<PolymorphicConfig> {
        match (&polymorphic.name, &polymorphic.discriminator, &polymorphic.foreign_key) {
            (_, Some(discriminator), Some(foreign_key)) => Ok(PolymorphicConfig {
                discriminator: discriminator.clone(),
                foreign_key: foreign_key.clone(),
            }),
            (Some(base), discriminator, foreign_key) => Ok(PolymorphicConfig {
                discriminator: discriminator
                    .clone()
                    .unwrap_or_else(|| self.convention.discriminator_for(base)),
                foreign_key: foreign_key
                    .clone()
                    .unwrap_or_else(|| self.convention.relation_key(base)),
            }),
            _ => Err(RelationshipError::InvalidConfiguration(format!(
                "Polymorphic relation '{}' on '{}' needs a name or explicit discriminator and foreign key",
                name, model
            ))
            .into()),
        }
    }

    /// Find or create the implicit join model of a hasAndBelongsToMany relation
    fn join_model_for(&mut self, source: &ModelDefinition, target: &ModelDefinition) -> ModelResult<String> {
        let candidates = inference::join_model_candidates(&source.name, &target.name);
        if let Some(existing) = candidates.iter().find(|c| self.is_defined(c)) {
            return Ok(existing.clone());
        }

        let join_name = candidates[0].clone();
        debug!(
            "Defining join model '{}' for '{}' and '{}'",
            join_name, source.name, target.name
        );
        let source_key = self.convention.foreign_key_for(&source.name);
        let target_key = self.convention.foreign_key_for(&target.name);
        let join = ModelDefinition::new(&join_name)
            .property(&source_key, source.id_type)
            .property(&target_key, target.id_type);
        let join_id = self.intern(&join_name);
        self.slots[join_id.0].definition = Some(join);

        for (endpoint, key) in [(&source.name, &source_key), (&target.name, &target_key)] {
            let relation_name = inference::camelize_lower(endpoint);
            let params = RelationParams::belongs_to(endpoint).foreign_key(key);
            if let Binding::Bound(definition) = self.try_bind(join_id, &relation_name, &params)? {
                self.store_relation(
                    join_id,
                    &relation_name,
                    RelationSlot::Bound {
                        params,
                        definition: Arc::new(definition),
                    },
                );
            }
        }

        Ok(join_name)
    }

    /// Registry statistics
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for slot in &self.slots {
            if slot.definition.is_some() {
                stats.total_models += 1;
            }
            for (_, relation) in &slot.relations {
                stats.total_relations += 1;
                match relation {
                    RelationSlot::Bound { definition, .. } => {
                        *stats.relations_by_type.entry(definition.kind).or_insert(0) += 1;
                        if definition.polymorphic.is_some() {
                            stats.polymorphic_relations += 1;
                        }
                    }
                    RelationSlot::Pending { params, .. } => {
                        stats.pending_relations += 1;
                        if let Some(kind) = params.kind.as_deref().and_then(|k| k.parse::<RelationType>().ok()) {
                            *stats.relations_by_type.entry(kind).or_insert(0) += 1;
                        }
                    }
                }
            }
        }
        stats
    }

    /// Declared parameters of a relation (bound or pending)
    pub fn relation_params(&self, model: &str, name: &str) -> Option<&RelationParams> {
        self.find_slot(model, name).map(RelationSlot::params)
    }
}

/// Statistics about the registry contents
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total_models: usize,
    pub total_relations: usize,
    pub pending_relations: usize,
    pub polymorphic_relations: usize,
    pub relations_by_type: HashMap<RelationType, usize>,
}

impl RegistryStats {
    /// Most common relation type, ties broken by declaration order of the type list
    pub fn most_common_relation_type(&self) -> Option<(RelationType, usize)> {
        RelationType::ALL
            .iter()
            .filter_map(|kind| self.relations_by_type.get(kind).map(|count| (*kind, *count)))
            .fold(None, |best, (kind, count)| match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((kind, count)),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relationships::metadata::{CollectSource, PolymorphicParams};

    fn registry_with(models: &[&str]) -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        for model in models {
            registry.define_model(ModelDefinition::new(model)).unwrap();
        }
        registry
    }

    fn bound(registry: &ModelRegistry, model: &str, name: &str) -> Arc<RelationDefinition> {
        registry.relation(model, name).unwrap().unwrap()
    }

    #[test]
    fn test_belongs_to_derivation_and_injection() {
        let mut registry = registry_with(&["User", "Post"]);
        registry
            .define_relation("Post", "author", RelationParams::belongs_to("User"))
            .unwrap();

        let rel = bound(&registry, "Post", "author");
        assert_eq!(rel.key_from, "authorId");
        assert_eq!(rel.key_to, "id");
        assert!(!rel.multiple);
        assert_eq!(
            registry.model("Post").unwrap().property_type("authorId"),
            Some(PropertyType::Number)
        );
    }

    #[test]
    fn test_has_many_derivation_mirrors_source_id_type() {
        let mut registry = ModelRegistry::new();
        registry
            .define_model(ModelDefinition::new("Author").id_property("slug", PropertyType::String))
            .unwrap();
        registry.define_model(ModelDefinition::new("Book")).unwrap();
        registry
            .define_relation("Author", "books", RelationParams::has_many("Book"))
            .unwrap();

        let rel = bound(&registry, "Author", "books");
        assert_eq!(rel.key_from, "slug");
        assert_eq!(rel.key_to, "authorId");
        assert!(rel.multiple);
        assert_eq!(
            registry.model("Book").unwrap().property_type("authorId"),
            Some(PropertyType::String)
        );
    }

    #[test]
    fn test_unknown_and_missing_type_fail_at_definition() {
        let mut registry = registry_with(&["User", "Post"]);
        let unknown = RelationParams {
            kind: Some("hasLots".to_string()),
            model: Some("Post".to_string()),
            ..RelationParams::default()
        };
        assert!(matches!(
            registry.define_relation("User", "posts", unknown),
            Err(ModelError::Configuration(_))
        ));

        let missing = RelationParams::default().model("Post");
        assert!(matches!(
            registry.define_relation("User", "posts", missing),
            Err(ModelError::Configuration(_))
        ));
        assert!(registry.relations("User").is_empty());
    }

    #[test]
    fn test_deferred_binding_resolves_when_target_defined() {
        let mut registry = registry_with(&["User"]);
        let status = registry
            .define_relation("User", "posts", RelationParams::has_many("Post"))
            .unwrap();
        assert_eq!(status, RelationStatus::Pending("Post".to_string()));
        assert!(matches!(
            registry.relation("User", "posts"),
            Err(ModelError::Relationship(_))
        ));
        assert_eq!(registry.stats().pending_relations, 1);

        registry.define_model(ModelDefinition::new("Post")).unwrap();
        let rel = bound(&registry, "User", "posts");
        assert_eq!(rel.key_to, "userId");
        assert!(registry.pending().is_empty());
        assert!(registry.model("Post").unwrap().has_property("userId"));
    }

    #[test]
    fn test_model_ids_are_stable() {
        let mut registry = ModelRegistry::new();
        let early = registry.intern("Post");
        let defined = registry.define_model(ModelDefinition::new("Post")).unwrap();
        assert_eq!(early, defined);
        assert_eq!(registry.model_name(early), Some("Post"));
    }

    #[test]
    fn test_polymorphic_belongs_to_binds_without_target() {
        let mut registry = registry_with(&["Picture"]);
        let status = registry
            .define_relation("Picture", "imageable", RelationParams::belongs_to_polymorphic("imageable"))
            .unwrap();
        assert_eq!(status, RelationStatus::Bound);

        let rel = bound(&registry, "Picture", "imageable");
        assert!(rel.model_to.is_none());
        let poly = rel.polymorphic.as_ref().unwrap();
        assert_eq!(poly.discriminator, "imageableType");
        assert_eq!(poly.foreign_key, "imageableId");
        assert_eq!(rel.key_from, "imageableId");
    }

    #[test]
    fn test_polymorphic_has_many() {
        let mut registry = registry_with(&["Author", "Picture"]);
        registry
            .define_relation(
                "Author",
                "pictures",
                RelationParams::has_many("Picture").polymorphic(PolymorphicParams::named("imageable")),
            )
            .unwrap();

        let rel = bound(&registry, "Author", "pictures");
        assert_eq!(rel.key_to, "imageableId");
        assert_eq!(rel.polymorphic.as_ref().unwrap().discriminator, "imageableType");
        assert!(registry.model("Picture").unwrap().has_property("imageableType"));
    }

    #[test]
    fn test_through_collect_resolves_after_belongs_to_added() {
        let mut registry = registry_with(&["Assembly", "Part", "AssemblyPart"]);
        registry
            .define_relation("Assembly", "parts", RelationParams::has_many("Part").through("AssemblyPart"))
            .unwrap();
        let before = bound(&registry, "Assembly", "parts");
        assert_eq!(before.kind, RelationType::HasManyThrough);
        let through = before.through.as_ref().unwrap();
        assert_eq!(through.collect, "part");
        assert_eq!(through.collect_source, CollectSource::Fallback);

        registry
            .define_relation("AssemblyPart", "component", RelationParams::belongs_to("Part"))
            .unwrap();
        let after = bound(&registry, "Assembly", "parts");
        let through = after.through.as_ref().unwrap();
        assert_eq!(through.collect, "component");
        assert_eq!(through.key_through, "componentId");
        assert_eq!(through.collect_source, CollectSource::MatchedTargetModel);
        assert_eq!(after.key_to, "assemblyId");
    }

    #[test]
    fn test_collect_tie_break_is_declaration_order() {
        let mut registry = registry_with(&["Assembly", "Part", "AssemblyPart"]);
        registry
            .define_relation("AssemblyPart", "primary", RelationParams::belongs_to("Part"))
            .unwrap();
        registry
            .define_relation("AssemblyPart", "secondary", RelationParams::belongs_to("Part"))
            .unwrap();
        registry
            .define_relation("Assembly", "parts", RelationParams::has_many("Part").through("AssemblyPart"))
            .unwrap();

        let through = bound(&registry, "Assembly", "parts").through.clone().unwrap();
        assert_eq!(through.collect, "primary");
        assert_eq!(through.key_through, "primaryId");
    }

    #[test]
    fn test_collect_foreign_key_beats_earlier_target_match() {
        let mut registry = registry_with(&["Assembly", "Part", "AssemblyPart"]);
        registry
            .define_relation("AssemblyPart", "replacement", RelationParams::belongs_to("Part"))
            .unwrap();
        registry
            .define_relation("AssemblyPart", "part", RelationParams::belongs_to("Part"))
            .unwrap();
        registry
            .define_relation("Assembly", "parts", RelationParams::has_many("Part").through("AssemblyPart"))
            .unwrap();

        let through = bound(&registry, "Assembly", "parts").through.clone().unwrap();
        assert_eq!(through.collect, "part");
        assert_eq!(through.key_through, "partId");
        assert_eq!(through.collect_source, CollectSource::MatchedForeignKey);
    }

    #[test]
    fn test_rekeyed_through_moves_injected_property() {
        let mut registry = registry_with(&["Assembly", "Part", "AssemblyPart"]);
        registry
            .define_relation("Assembly", "parts", RelationParams::has_many("Part").through("AssemblyPart"))
            .unwrap();
        assert!(registry.model("AssemblyPart").unwrap().has_property("partId"));

        registry
            .define_relation("AssemblyPart", "replacement", RelationParams::belongs_to("Part"))
            .unwrap();

        let through = bound(&registry, "Assembly", "parts").through.clone().unwrap();
        assert_eq!(through.key_through, "replacementId");
        let join = registry.model("AssemblyPart").unwrap();
        assert!(join.has_property("replacementId"));
        assert!(join.has_property("assemblyId"));
        assert!(!join.has_property("partId"));
    }

    #[test]
    fn test_rekeyed_through_keeps_declared_property() {
        let mut registry = registry_with(&["Assembly", "Part"]);
        registry
            .define_model(ModelDefinition::new("AssemblyPart").property("partId", PropertyType::Number))
            .unwrap();
        registry
            .define_relation("Assembly", "parts", RelationParams::has_many("Part").through("AssemblyPart"))
            .unwrap();
        registry
            .define_relation("AssemblyPart", "replacement", RelationParams::belongs_to("Part"))
            .unwrap();

        let join = registry.model("AssemblyPart").unwrap();
        assert_eq!(bound(&registry, "Assembly", "parts").through.as_ref().unwrap().key_through, "replacementId");
        assert!(join.has_property("partId"));
        assert!(join.has_property("replacementId"));
    }

    #[test]
    fn test_habtm_defines_join_model() {
        let mut registry = registry_with(&["Physician", "Patient"]);
        registry
            .define_relation("Physician", "patients", RelationParams::has_and_belongs_to_many("Patient"))
            .unwrap();

        let rel = bound(&registry, "Physician", "patients");
        let through = rel.through.as_ref().unwrap();
        assert_eq!(through.model, "PhysicianPatient");
        assert_eq!(through.collect, "patient");
        assert_eq!(through.key_through, "patientId");
        assert_eq!(rel.key_to, "physicianId");

        let join = registry.model("PhysicianPatient").unwrap();
        assert!(join.has_property("physicianId"));
        assert!(join.has_property("patientId"));
        assert_eq!(registry.relations("PhysicianPatient").len(), 2);
    }

    #[test]
    fn test_habtm_reuses_reversed_join_model() {
        let mut registry = registry_with(&["Physician", "Patient", "PatientPhysician"]);
        registry
            .define_relation("Physician", "patients", RelationParams::has_and_belongs_to_many("Patient"))
            .unwrap();
        let rel = bound(&registry, "Physician", "patients");
        assert_eq!(rel.through.as_ref().unwrap().model, "PatientPhysician");
        assert!(!registry.is_defined("PhysicianPatient"));
    }

    #[test]
    fn test_embedded_and_referenced_property_defaults() {
        let mut registry = registry_with(&["Customer", "Address", "Account"]);
        registry
            .define_relation("Customer", "address", RelationParams::embeds_one("Address"))
            .unwrap();
        registry
            .define_relation("Customer", "shipping", RelationParams::embeds_many("Address"))
            .unwrap();
        registry
            .define_relation("Customer", "accounts", RelationParams::references_many("Account"))
            .unwrap();

        assert_eq!(bound(&registry, "Customer", "address").key_from, "address");
        assert_eq!(bound(&registry, "Customer", "shipping").key_from, "addresses");
        assert_eq!(bound(&registry, "Customer", "accounts").key_from, "accountIds");
    }

    #[test]
    fn test_redefining_relation_keeps_position() {
        let mut registry = registry_with(&["User", "Post", "Comment"]);
        registry.define_relation("User", "posts", RelationParams::has_many("Post")).unwrap();
        registry.define_relation("User", "comments", RelationParams::has_many("Comment")).unwrap();
        registry
            .define_relation("User", "posts", RelationParams::has_many("Post").foreign_key("ownerId"))
            .unwrap();

        let names: Vec<_> = registry.relations("User").iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["posts", "comments"]);
        assert_eq!(bound(&registry, "User", "posts").key_to, "ownerId");
    }

    #[test]
    fn test_underscore_convention() {
        let mut registry = ModelRegistry::new().with_convention(ForeignKeyConvention::Underscore);
        registry.define_model(ModelDefinition::new("BlogPost")).unwrap();
        registry.define_model(ModelDefinition::new("Comment")).unwrap();
        registry
            .define_relation("BlogPost", "comments", RelationParams::has_many("Comment"))
            .unwrap();
        assert_eq!(bound(&registry, "BlogPost", "comments").key_to, "blog_post_id");
    }

    #[test]
    fn test_model_from_value() {
        let model = ModelDefinition::from_value(
            "Book",
            &serde_json::json!({
                "properties": {
                    "isbn": { "type": "string", "id": true },
                    "title": "string",
                    "pages": { "type": "number" }
                }
            }),
        )
        .unwrap();
        assert_eq!(model.id_property, "isbn");
        assert_eq!(model.id_type, PropertyType::String);
        assert!(!model.has_property("id"));
        assert_eq!(model.property_type("pages"), Some(PropertyType::Number));

        assert!(ModelDefinition::from_value("Book", &serde_json::json!({ "properties": { "x": "decimal" } })).is_err());
    }

    #[test]
    fn test_stats() {
        let mut registry = registry_with(&["User", "Post"]);
        registry.define_relation("User", "posts", RelationParams::has_many("Post")).unwrap();
        registry.define_relation("Post", "author", RelationParams::belongs_to("User")).unwrap();
        registry.define_relation("Post", "tags", RelationParams::has_many("Tag")).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.total_models, 2);
        assert_eq!(stats.total_relations, 3);
        assert_eq!(stats.pending_relations, 1);
        assert_eq!(stats.most_common_relation_type(), Some((RelationType::HasMany, 2)));
    }
}
