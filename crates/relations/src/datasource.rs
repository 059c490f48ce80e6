//! Data source - registry, connector and include resolution behind one handle
//!
//! The registry sits behind a std `RwLock`; guards are only taken inside
//! synchronous helpers and relations are handed out as `Arc` snapshots, so no
//! lock is ever held across a connector call.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use crate::config::IncludeConfig;
use crate::connector::{Collection, Connector};
use crate::error::{ModelError, ModelResult};
use crate::filter::{Filter, QueryOptions, Row};
use crate::record::Record;
use crate::relationships::accessor::RelationAccessor;
use crate::relationships::eager_loading::IncludeResolver;
use crate::relationships::include::IncludeSpec;
use crate::relationships::metadata::{RelationDefinition, RelationParams};
use crate::relationships::registry::{
    ModelDefinition, ModelId, ModelRegistry, RegistryStats, RelationStatus,
};

/// Models, relations and storage for one application
#[derive(Clone)]
pub struct DataSource {
    registry: Arc<RwLock<ModelRegistry>>,
    connector: Arc<dyn Connector>,
    config: IncludeConfig,
}

impl DataSource {
    /// Create a data source with an empty registry and default configuration
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            registry: Arc::new(RwLock::new(ModelRegistry::new())),
            connector,
            config: IncludeConfig::default(),
        }
    }

    /// Use a preconfigured registry (for example one with another key convention)
    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = Arc::new(RwLock::new(registry));
        self
    }

    pub fn with_config(mut self, config: IncludeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &IncludeConfig {
        &self.config
    }

    pub fn connector(&self) -> &dyn Connector {
        self.connector.as_ref()
    }

    fn read(&self) -> ModelResult<RwLockReadGuard<'_, ModelRegistry>> {
        self.registry
            .read()
            .map_err(|_| ModelError::Configuration("Model registry lock poisoned".to_string()))
    }

    fn write(&self) -> ModelResult<RwLockWriteGuard<'_, ModelRegistry>> {
        self.registry
            .write()
            .map_err(|_| ModelError::Configuration("Model registry lock poisoned".to_string()))
    }

    /// Define a model
    pub fn define_model(&self, definition: ModelDefinition) -> ModelResult<ModelId> {
        self.write()?.define_model(definition)
    }

    /// Define a model and its relations from JSON:
    /// `{"properties": {...}, "relations": {"posts": {"type": "hasMany", "model": "Post"}}}`
    pub fn define_model_value(&self, name: &str, value: &Value) -> ModelResult<ModelId> {
        let definition = ModelDefinition::from_value(name, value)?;
        let mut registry = self.write()?;
        let id = registry.define_model(definition)?;

        match value.get("relations") {
            None | Some(Value::Null) => {}
            Some(Value::Object(relations)) => {
                for (relation, params) in relations {
                    registry.define_relation(name, relation, RelationParams::from_value(params)?)?;
                }
            }
            Some(_) => {
                return Err(ModelError::Configuration(format!(
                    "Relations of model '{}' must be an object",
                    name
                )))
            }
        }
        Ok(id)
    }

    /// Declare a relation; fails at once on a missing or unknown type
    pub fn define_relation(&self, model: &str, name: &str, params: RelationParams) -> ModelResult<RelationStatus> {
        self.write()?.define_relation(model, name, params)
    }

    /// Declare a relation from its JSON form
    pub fn define_relation_value(&self, model: &str, name: &str, value: &Value) -> ModelResult<RelationStatus> {
        let params = RelationParams::from_value(value)?;
        self.define_relation(model, name, params)
    }

    /// Look up a relation; `Ok(None)` if the model has no such relation
    pub fn relation(&self, model: &str, name: &str) -> ModelResult<Option<Arc<RelationDefinition>>> {
        self.read()?.relation(model, name)
    }

    /// Look up a relation, failing if it does not exist
    pub fn require_relation(&self, model: &str, name: &str) -> ModelResult<Arc<RelationDefinition>> {
        self.relation(model, name)?.ok_or_else(|| {
            ModelError::Relationship(format!("Relation '{}' is not defined on model '{}'", name, model))
        })
    }

    /// Bound relations of a model in declaration order
    pub fn relations(&self, model: &str) -> ModelResult<Vec<Arc<RelationDefinition>>> {
        Ok(self.read()?.relations(model))
    }

    pub fn model(&self, name: &str) -> ModelResult<Option<ModelDefinition>> {
        Ok(self.read()?.model(name).cloned())
    }

    pub fn collection(&self, model: &str) -> ModelResult<Collection> {
        self.read()?.collection(model)
    }

    pub fn stats(&self) -> ModelResult<RegistryStats> {
        Ok(self.read()?.stats())
    }

    /// Find records, resolving `filter.include`
    pub async fn find(&self, model: &str, filter: &Filter) -> ModelResult<Vec<Record>> {
        self.find_with_options(model, filter, &QueryOptions::new()).await
    }

    /// Find records with connector options
    pub async fn find_with_options(
        &self,
        model: &str,
        filter: &Filter,
        options: &QueryOptions,
    ) -> ModelResult<Vec<Record>> {
        let collection = self.collection(model)?;
        let include = match &filter.include {
            Some(include) => IncludeSpec::from_value(include)?,
            None => IncludeSpec::new(),
        };

        let mut query = filter.clone();
        query.include = None;
        let rows = self.connector.find(&collection, &query, options).await?;
        let mut records: Vec<Record> = rows
            .into_iter()
            .map(|row| Record::persisted(&collection.name, &collection.id_property, row))
            .collect();

        IncludeResolver::new(self, options)
            .resolve(model, &mut records, &include)
            .await?;
        Ok(records)
    }

    /// Find the first matching record
    pub async fn find_one(&self, model: &str, filter: &Filter) -> ModelResult<Option<Record>> {
        let filter = filter.clone().limit(1);
        Ok(self.find(model, &filter).await?.into_iter().next())
    }

    /// Find a record by primary key, resolving `include` if given
    pub async fn find_by_id(
        &self,
        model: &str,
        id: &Value,
        include: Option<&IncludeSpec>,
    ) -> ModelResult<Option<Record>> {
        let collection = self.collection(model)?;
        let options = QueryOptions::new();
        let row = match self.connector.find_by_id(&collection, id, &options).await? {
            Some(row) => row,
            None => return Ok(None),
        };

        let mut records = vec![Record::persisted(&collection.name, &collection.id_property, row)];
        if let Some(spec) = include {
            IncludeResolver::new(self, &options)
                .resolve(model, &mut records, spec)
                .await?;
        }
        Ok(records.pop())
    }

    /// Resolve an include spec for already materialized records
    pub async fn include(&self, model: &str, records: &mut [Record], spec: &IncludeSpec) -> ModelResult<()> {
        let options = QueryOptions::new();
        IncludeResolver::new(self, &options).resolve(model, records, spec).await
    }

    /// Insert a new record
    pub async fn create(&self, model: &str, data: Row) -> ModelResult<Record> {
        let collection = self.collection(model)?;
        let row = self.connector.create(&collection, data, &QueryOptions::new()).await?;
        Ok(Record::persisted(&collection.name, &collection.id_property, row))
    }

    /// Insert a record unless persisted, otherwise write its data back
    pub async fn save(&self, record: &mut Record) -> ModelResult<()> {
        let collection = self.collection(record.model())?;
        let options = QueryOptions::new();
        let row = if record.is_persisted() {
            let id = record.require_id()?.clone();
            self.connector
                .update_attributes(&collection, &id, record.data().clone(), &options)
                .await?
        } else {
            self.connector.create(&collection, record.data().clone(), &options).await?
        };
        record.mark_persisted(row);
        Ok(())
    }

    /// Write selected fields of a persisted record
    pub(crate) async fn update_fields(&self, record: &mut Record, fields: Row) -> ModelResult<()> {
        if !record.is_persisted() {
            return Ok(());
        }
        let collection = self.collection(record.model())?;
        let id = record.require_id()?.clone();
        let row = self
            .connector
            .update_attributes(&collection, &id, fields, &QueryOptions::new())
            .await?;
        record.mark_persisted(row);
        Ok(())
    }

    /// Delete a record
    pub async fn destroy(&self, record: &mut Record) -> ModelResult<bool> {
        let collection = self.collection(record.model())?;
        let id = record.require_id()?.clone();
        let removed = self.connector.destroy(&collection, &id, &QueryOptions::new()).await?;
        record.mark_deleted();
        Ok(removed)
    }

    /// Count records matching `where_clause`
    pub async fn count(&self, model: &str, where_clause: Option<&Row>) -> ModelResult<usize> {
        let collection = self.collection(model)?;
        self.connector.count(&collection, where_clause, &QueryOptions::new()).await
    }

    /// Accessor for relation `name` of `record`
    pub fn relation_accessor<'r>(&'r self, record: &'r mut Record, name: &str) -> ModelResult<RelationAccessor<'r>> {
        let relation = self.require_relation(record.model(), name)?;
        Ok(RelationAccessor::new(self, relation, record))
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("connector", &self.connector.name())
            .field("config", &self.config)
            .finish()
    }
}
