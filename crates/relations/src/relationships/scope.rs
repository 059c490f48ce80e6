//! Scope Composer - effective query filters for relations
//!
//! The filter used to fetch a relation is layered, lowest precedence first:
//!
//! 1. the relation's static scope
//! 2. a dynamic scope function evaluated against the owning record
//! 3. the polymorphic discriminator constraint (`{<type>: modelFrom}`)
//! 4. the caller's per-call filter
//! 5. `properties`, as equality conditions (instance queries only)
//!
//! Clauses are merged last-wins, except `where` which is ANDed.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::filter::{Filter, Row};
use crate::record::Record;
use super::metadata::{RelationDefinition, RelationType};

/// Scope function evaluated against the owning record on every call
pub type ScopeFn = Arc<dyn Fn(&Record) -> Filter + Send + Sync>;

/// Properties function computing `{targetProp: value}` from the owning record
pub type PropertiesFn = Arc<dyn Fn(&Record) -> Row + Send + Sync>;

/// Relation scope: a fixed filter, or one computed from the owning record
#[derive(Clone)]
pub enum Scope {
    Static(Filter),
    Dynamic(ScopeFn),
}

impl Scope {
    /// Wrap a closure as a dynamic scope
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&Record) -> Filter + Send + Sync + 'static,
    {
        Scope::Dynamic(Arc::new(f))
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Scope::Dynamic(_))
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Static(filter) => f.debug_tuple("Static").field(filter).finish(),
            Scope::Dynamic(_) => f.write_str("Dynamic(<fn>)"),
        }
    }
}

/// Denormalized properties copied from the owner onto related records
#[derive(Clone)]
pub enum Properties {
    /// `(sourceProp, targetProp)` pairs
    Mapping(Vec<(String, String)>),
    Dynamic(PropertiesFn),
}

impl Properties {
    pub fn mapping<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Properties::Mapping(pairs.into_iter().collect())
    }

    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&Record) -> Row + Send + Sync + 'static,
    {
        Properties::Dynamic(Arc::new(f))
    }

    /// Target-side values computed for `owner`
    pub fn values(&self, owner: &Record) -> Row {
        match self {
            Properties::Mapping(pairs) => pairs
                .iter()
                .filter_map(|(source, target)| {
                    owner.get(source).map(|value| (target.clone(), value.clone()))
                })
                .collect(),
            Properties::Dynamic(f) => f(owner),
        }
    }
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Properties::Mapping(pairs) => f.debug_tuple("Mapping").field(pairs).finish(),
            Properties::Dynamic(_) => f.write_str("Dynamic(<fn>)"),
        }
    }
}

/// Builds effective filters for one relation
pub struct ScopeComposer<'a> {
    relation: &'a RelationDefinition,
}

impl<'a> ScopeComposer<'a> {
    pub fn new(relation: &'a RelationDefinition) -> Self {
        Self { relation }
    }

    /// Static scope only
    pub fn static_scope(&self) -> Filter {
        match &self.relation.scope {
            Some(Scope::Static(filter)) => filter.clone(),
            _ => Filter::new(),
        }
    }

    /// Dynamic scope evaluated for `owner`; `None` for static or absent scopes
    pub fn dynamic_scope(&self, owner: &Record) -> Option<Filter> {
        match &self.relation.scope {
            Some(Scope::Dynamic(f)) => Some(f(owner)),
            _ => None,
        }
    }

    /// `{discriminator: modelFrom}` for polymorphic hasMany/hasOne
    pub fn discriminator_constraint(&self) -> Option<Filter> {
        let polymorphic = self.relation.polymorphic.as_ref()?;
        match self.relation.kind {
            RelationType::HasMany | RelationType::HasOne => Some(Filter::new().where_eq(
                &polymorphic.discriminator,
                Value::String(self.relation.model_from.clone()),
            )),
            _ => None,
        }
    }

    /// Scope shared by every parent in a batch: static scope, the
    /// per-group dynamic fragment, the discriminator, then the caller filter
    pub fn for_batch(&self, fragment: Option<&Filter>, caller: Option<&Filter>) -> Filter {
        let mut filter = self.static_scope();
        if let Some(fragment) = fragment {
            filter = filter.merge(fragment);
        }
        if let Some(constraint) = self.discriminator_constraint() {
            filter = filter.merge(&constraint);
        }
        if let Some(caller) = caller {
            filter = filter.merge(caller);
        }
        filter
    }

    /// Full filter for a query scoped to one owning record
    pub fn for_instance(&self, owner: &Record, caller: Option<&Filter>) -> Filter {
        let fragment = self.dynamic_scope(owner);
        let filter = self.for_batch(fragment.as_ref(), caller);
        let properties = self.properties_for(owner);
        if properties.is_empty() {
            filter
        } else {
            filter.and_where(properties)
        }
    }

    /// Denormalized fields to stamp onto children built for `owner`
    pub fn properties_for(&self, owner: &Record) -> Row {
        self.relation
            .properties
            .as_ref()
            .map(|p| p.values(owner))
            .unwrap_or_default()
    }

    /// Fields every child of `owner` must carry: properties, the static
    /// scope's plain equality conditions and the discriminator value
    pub fn stamped_fields(&self, owner: &Record) -> Row {
        let mut fields = Row::new();
        if let Some(clause) = self.static_scope().where_clause {
            for (key, value) in clause {
                if is_plain_value(&value) {
                    fields.insert(key, value);
                }
            }
        }
        if let Some(polymorphic) = &self.relation.polymorphic {
            if matches!(self.relation.kind, RelationType::HasMany | RelationType::HasOne) {
                fields.insert(
                    polymorphic.discriminator.clone(),
                    Value::String(self.relation.model_from.clone()),
                );
            }
        }
        fields.extend(self.properties_for(owner));
        fields
    }
}

fn is_plain_value(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}
