//! Storage Connector Traits
//!
//! The relation core never talks to a database directly. Everything it needs
//! from storage goes through [`Connector`]: filtered finds, id lookups and the
//! handful of writes used by relation accessors. Filters are passed through
//! as opaque [`Filter`] objects; the connector owns the query grammar.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ModelResult;
use crate::filter::{Filter, QueryOptions, Row};
use crate::relationships::registry::PropertyType;

pub mod memory;

pub use memory::MemoryConnector;

/// Storage descriptor for one model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    /// Model (and collection) name
    pub name: String,
    /// Primary key property
    pub id_property: String,
    /// Primary key type, used when ids are generated
    pub id_type: PropertyType,
}

impl Collection {
    pub fn new(name: &str, id_property: &str, id_type: PropertyType) -> Self {
        Self {
            name: name.to_string(),
            id_property: id_property.to_string(),
            id_type,
        }
    }
}

/// Abstract storage connector
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connector name, for logging
    fn name(&self) -> &str;

    /// Whether `where` clauses may use `inq` membership conditions.
    ///
    /// Connectors returning false receive one equality query per key instead.
    fn supports_inq(&self) -> bool {
        true
    }

    /// Find all rows matching `filter`
    async fn find(&self, collection: &Collection, filter: &Filter, options: &QueryOptions) -> ModelResult<Vec<Row>>;

    /// Find a row by primary key
    async fn find_by_id(&self, collection: &Collection, id: &Value, options: &QueryOptions) -> ModelResult<Option<Row>>;

    /// Insert a row, returning it with its primary key set
    async fn create(&self, collection: &Collection, data: Row, options: &QueryOptions) -> ModelResult<Row>;

    /// Merge `data` into the row with the given id, returning the updated row
    async fn update_attributes(
        &self,
        collection: &Collection,
        id: &Value,
        data: Row,
        options: &QueryOptions,
    ) -> ModelResult<Row>;

    /// Delete the row with the given id; returns whether a row was removed
    async fn destroy(&self, collection: &Collection, id: &Value, options: &QueryOptions) -> ModelResult<bool>;

    /// Delete all rows matching `where_clause` (all rows when `None`)
    async fn destroy_all(
        &self,
        collection: &Collection,
        where_clause: Option<&Row>,
        options: &QueryOptions,
    ) -> ModelResult<usize>;

    /// Count rows matching `where_clause` (all rows when `None`)
    async fn count(&self, collection: &Collection, where_clause: Option<&Row>, options: &QueryOptions) -> ModelResult<usize>;
}
