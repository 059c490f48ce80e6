//! Relationship Metadata System - Core metadata definitions for relations
//!
//! A [`RelationDefinition`] is derived once, when the relation is declared,
//! from the caller's [`RelationParams`]. Everything the resolver needs (join
//! keys, discriminators, through-model keys) is computed up front so nothing
//! is re-derived per call.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ModelError, ModelResult, RelationshipError};
use crate::filter::Filter;
use super::scope::{Properties, Scope};

/// The kind of a relation between two models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationType {
    /// Many-to-one: the source holds the foreign key
    BelongsTo,
    /// One-to-many: the target holds the foreign key
    HasMany,
    /// One-to-one: the target holds the foreign key
    HasOne,
    /// One-to-many through an intermediate model
    HasManyThrough,
    /// Many-to-many through a join model
    HasAndBelongsToMany,
    /// The source holds an array of target ids
    ReferencesMany,
    /// A single target document stored inline on the source
    EmbedsOne,
    /// A list of target documents stored inline on the source
    EmbedsMany,
}

impl RelationType {
    /// All known relation types
    pub const ALL: [RelationType; 8] = [
        Self::BelongsTo,
        Self::HasMany,
        Self::HasOne,
        Self::HasManyThrough,
        Self::HasAndBelongsToMany,
        Self::ReferencesMany,
        Self::EmbedsOne,
        Self::EmbedsMany,
    ];

    /// The declared name of this type (`"belongsTo"`, `"hasMany"`, ...)
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BelongsTo => "belongsTo",
            Self::HasMany => "hasMany",
            Self::HasOne => "hasOne",
            Self::HasManyThrough => "hasManyThrough",
            Self::HasAndBelongsToMany => "hasAndBelongsToMany",
            Self::ReferencesMany => "referencesMany",
            Self::EmbedsOne => "embedsOne",
            Self::EmbedsMany => "embedsMany",
        }
    }

    /// Returns true if this relation resolves to a list
    pub fn is_multiple(self) -> bool {
        matches!(
            self,
            Self::HasMany
                | Self::HasManyThrough
                | Self::HasAndBelongsToMany
                | Self::ReferencesMany
                | Self::EmbedsMany
        )
    }

    /// Returns true if this relation goes through a join model
    pub fn uses_through(self) -> bool {
        matches!(self, Self::HasManyThrough | Self::HasAndBelongsToMany)
    }

    /// Returns true if the related data lives inline on the source record
    pub fn is_embedded(self) -> bool {
        matches!(self, Self::EmbedsOne | Self::EmbedsMany)
    }

    /// Returns true if the target record holds the foreign key
    pub fn target_holds_key(self) -> bool {
        matches!(self, Self::HasMany | Self::HasOne)
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Polymorphic declaration as given by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolymorphicParams {
    /// Base name for the derived columns (`imageable` → `imageableId`, `imageableType`)
    pub name: Option<String>,
    /// Explicit discriminator property
    pub discriminator: Option<String>,
    /// Explicit foreign key property
    pub foreign_key: Option<String>,
}

impl PolymorphicParams {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }
}

/// Resolved polymorphic configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolymorphicConfig {
    /// Property holding the target (or owner) model name
    pub discriminator: String,
    /// Property holding the target (or owner) id
    pub foreign_key: String,
}

/// How the collect key of a through relation was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectSource {
    /// Matched the explicit `keyThrough` option
    ExplicitKeyThrough,
    /// Matched a belongsTo on the through model by foreign key
    MatchedForeignKey,
    /// Matched the first belongsTo on the through model targeting the target model
    MatchedTargetModel,
    /// No belongsTo matched: lower-cased target model name
    Fallback,
}

/// Resolved through-model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughConfig {
    /// The join model
    pub model: String,
    /// Property on the join model pointing at the target
    pub key_through: String,
    /// belongsTo relation on the join model used as the return path
    pub collect: String,
    /// How `collect` was resolved
    pub collect_source: CollectSource,
    /// Whether `key_through` was given explicitly
    pub explicit_key_through: bool,
}

/// Per-relation options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelationOptions {
    /// Skip this relation when it appears in an include spec
    pub disable_include: bool,
    /// Always generate ids for embedded items, ignoring supplied ones
    pub force_id: bool,
    /// Validate embedded items (duplicate ids)
    pub validate: bool,
    /// Property holding embedded/referenced data
    pub property: Option<String>,
}

impl Default for RelationOptions {
    fn default() -> Self {
        Self {
            disable_include: false,
            force_id: false,
            validate: true,
            property: None,
        }
    }
}

/// Parameters used to declare a relation
#[derive(Debug, Clone, Default)]
pub struct RelationParams {
    /// Relation type name; validated at declaration
    pub kind: Option<String>,
    /// Target model name (absent for polymorphic belongsTo)
    pub model: Option<String>,
    pub foreign_key: Option<String>,
    pub primary_key: Option<String>,
    pub through: Option<String>,
    pub key_through: Option<String>,
    pub polymorphic: Option<PolymorphicParams>,
    pub scope: Option<Scope>,
    pub properties: Option<Properties>,
    pub options: RelationOptions,
}

impl RelationParams {
    /// Start parameters for the given relation type
    pub fn new(kind: RelationType) -> Self {
        Self {
            kind: Some(kind.as_str().to_string()),
            ..Self::default()
        }
    }

    pub fn belongs_to(model: &str) -> Self {
        Self::new(RelationType::BelongsTo).model(model)
    }

    pub fn has_many(model: &str) -> Self {
        Self::new(RelationType::HasMany).model(model)
    }

    pub fn has_one(model: &str) -> Self {
        Self::new(RelationType::HasOne).model(model)
    }

    pub fn has_many_through(model: &str, through: &str) -> Self {
        Self::new(RelationType::HasManyThrough).model(model).through(through)
    }

    pub fn has_and_belongs_to_many(model: &str) -> Self {
        Self::new(RelationType::HasAndBelongsToMany).model(model)
    }

    pub fn references_many(model: &str) -> Self {
        Self::new(RelationType::ReferencesMany).model(model)
    }

    pub fn embeds_one(model: &str) -> Self {
        Self::new(RelationType::EmbedsOne).model(model)
    }

    pub fn embeds_many(model: &str) -> Self {
        Self::new(RelationType::EmbedsMany).model(model)
    }

    /// Polymorphic belongsTo: the target model is read from `<name>Type`
    pub fn belongs_to_polymorphic(name: &str) -> Self {
        Self::new(RelationType::BelongsTo).polymorphic(PolymorphicParams::named(name))
    }

    pub fn model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn foreign_key(mut self, key: &str) -> Self {
        self.foreign_key = Some(key.to_string());
        self
    }

    pub fn primary_key(mut self, key: &str) -> Self {
        self.primary_key = Some(key.to_string());
        self
    }

    pub fn through(mut self, model: &str) -> Self {
        self.through = Some(model.to_string());
        self
    }

    pub fn key_through(mut self, key: &str) -> Self {
        self.key_through = Some(key.to_string());
        self
    }

    pub fn polymorphic(mut self, polymorphic: PolymorphicParams) -> Self {
        self.polymorphic = Some(polymorphic);
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn options(mut self, options: RelationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn disable_include(mut self) -> Self {
        self.options.disable_include = true;
        self
    }

    pub fn force_id(mut self) -> Self {
        self.options.force_id = true;
        self
    }

    pub fn property(mut self, property: &str) -> Self {
        self.options.property = Some(property.to_string());
        self
    }

    /// Parse the declared type, failing on a missing or unknown type
    pub fn relation_type(&self, name: &str) -> Result<RelationType, RelationshipError> {
        let declared = self
            .kind
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| RelationshipError::MissingType(name.to_string()))?;

        let kind = declared
            .parse::<RelationType>()
            .map_err(|kind| RelationshipError::UnknownType {
                name: name.to_string(),
                kind,
            })?;

        // hasMany declared with a through model is a has-many-through
        if kind == RelationType::HasMany && self.through.is_some() {
            return Ok(RelationType::HasManyThrough);
        }

        Ok(kind)
    }

    /// Parse relation parameters from a JSON model definition entry
    /// (`{"type": "hasMany", "model": "Post", "foreignKey": "authorId", ...}`)
    pub fn from_value(value: &Value) -> ModelResult<Self> {
        let object = value.as_object().ok_or_else(|| {
            ModelError::Configuration("Relation definition must be an object".to_string())
        })?;

        let text = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);

        let polymorphic = match object.get("polymorphic") {
            None | Some(Value::Null) | Some(Value::Bool(false)) => None,
            Some(Value::String(name)) => Some(PolymorphicParams::named(name)),
            Some(Value::Bool(true)) => Some(PolymorphicParams::default()),
            Some(other) => Some(serde_json::from_value(other.clone())?),
        };

        let scope = match object.get("scope") {
            None | Some(Value::Null) => None,
            Some(other) => Some(Scope::Static(Filter::from_value(other.clone())?)),
        };

        let properties = match object.get("properties") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(Properties::mapping(map.iter().filter_map(
                |(source, target)| target.as_str().map(|t| (source.clone(), t.to_string())),
            ))),
            Some(_) => {
                return Err(ModelError::Configuration(
                    "Relation properties must be an object".to_string(),
                ))
            }
        };

        let mut options: RelationOptions = match object.get("options") {
            Some(opts @ Value::Object(_)) => serde_json::from_value(opts.clone())?,
            _ => RelationOptions::default(),
        };
        if let Some(property) = text("property") {
            options.property = Some(property);
        }

        Ok(Self {
            kind: text("type"),
            model: text("model"),
            foreign_key: text("foreignKey"),
            primary_key: text("primaryKey"),
            through: text("through"),
            key_through: text("keyThrough"),
            polymorphic,
            scope,
            properties,
            options,
        })
    }
}

/// Fully derived, immutable metadata describing one relation
#[derive(Debug, Clone)]
pub struct RelationDefinition {
    /// Relation name (the property it is exposed under)
    pub name: String,
    pub kind: RelationType,
    /// Model declaring the relation
    pub model_from: String,
    /// Target model; `None` when it is read per record from a discriminator
    pub model_to: Option<String>,
    /// Join property on the source side
    pub key_from: String,
    /// Join property on the target side (the through model for through relations)
    pub key_to: String,
    /// Whether the relation resolves to a list
    pub multiple: bool,
    pub polymorphic: Option<PolymorphicConfig>,
    pub through: Option<ThroughConfig>,
    pub scope: Option<Scope>,
    pub properties: Option<Properties>,
    pub options: RelationOptions,
}

impl RelationDefinition {
    /// Target model name, failing for per-record polymorphic targets
    pub fn target_model(&self) -> ModelResult<&str> {
        self.model_to.as_deref().ok_or_else(|| {
            ModelError::Relationship(format!(
                "Relation '{}' on '{}' has no fixed target model",
                self.name, self.model_from
            ))
        })
    }

    /// True for a belongsTo whose target is chosen per record
    pub fn is_polymorphic_belongs_to(&self) -> bool {
        self.kind == RelationType::BelongsTo && self.polymorphic.is_some()
    }

    /// Whether the inclusion resolver may load this relation
    pub fn is_includable(&self) -> bool {
        !self.options.disable_include
    }

    /// Metadata summary as JSON, for introspection and debugging
    pub fn describe(&self) -> Value {
        let mut out = Map::new();
        out.insert("name".into(), Value::String(self.name.clone()));
        out.insert("type".into(), Value::String(self.kind.as_str().to_string()));
        out.insert("modelFrom".into(), Value::String(self.model_from.clone()));
        out.insert(
            "modelTo".into(),
            self.model_to.clone().map(Value::String).unwrap_or(Value::Null),
        );
        out.insert("keyFrom".into(), Value::String(self.key_from.clone()));
        out.insert("keyTo".into(), Value::String(self.key_to.clone()));
        out.insert("multiple".into(), Value::Bool(self.multiple));
        if let Some(poly) = &self.polymorphic {
            out.insert(
                "polymorphic".into(),
                serde_json::json!({
                    "discriminator": poly.discriminator,
                    "foreignKey": poly.foreign_key,
                }),
            );
        }
        if let Some(through) = &self.through {
            out.insert(
                "through".into(),
                serde_json::json!({
                    "model": through.model,
                    "keyThrough": through.key_through,
                    "collect": through.collect,
                }),
            );
        }
        Value::Object(out)
    }
}
