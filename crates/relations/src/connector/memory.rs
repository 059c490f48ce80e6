//! In-memory connector
//!
//! Rows live in a [`DashMap`] keyed by collection name. The `where` evaluator
//! understands the conditions the relation core emits (equality, `inq`,
//! `nin`, `neq`, `gt`/`gte`/`lt`/`lte`, `between`, `and`, `or`). Every `find`
//! is counted and logged so callers can assert how many queries a resolution
//! issued.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::{Map, Value};
use tracing::trace;

use crate::error::{ModelError, ModelResult};
use crate::filter::{Filter, QueryOptions, Row};
use crate::relationships::identity_map::IdentityKey;
use crate::relationships::registry::PropertyType;
use super::{Collection, Connector};

const OPERATORS: &[&str] = &["inq", "nin", "neq", "gt", "gte", "lt", "lte", "between"];

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Row>,
    next_id: u64,
}

/// A `find` issued against the connector
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedQuery {
    pub collection: String,
    pub filter: Filter,
}

/// Reference connector keeping all rows in memory
#[derive(Debug)]
pub struct MemoryConnector {
    tables: DashMap<String, Table>,
    finds: AtomicUsize,
    log: Mutex<Vec<LoggedQuery>>,
    inq: bool,
    latency: Option<Duration>,
    failing: DashSet<String>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    /// Create an empty connector with `inq` support
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            finds: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
            inq: true,
            latency: None,
            failing: DashSet::new(),
        }
    }

    /// Refuse `inq` conditions, as a connector without set membership would
    pub fn without_inq(mut self) -> Self {
        self.inq = false;
        self
    }

    /// Sleep before every operation
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every operation on `collection` fail
    pub fn fail_on(&self, collection: &str) {
        self.failing.insert(collection.to_string());
    }

    /// Stop failing operations on `collection`
    pub fn recover(&self, collection: &str) {
        self.failing.remove(collection);
    }

    /// Insert rows as-is, bypassing id generation
    pub fn seed<I>(&self, collection: &str, rows: I) -> ModelResult<()>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut table = self.tables.entry(collection.to_string()).or_default();
        for row in rows {
            match row {
                Value::Object(row) => {
                    if let Some(id) = row.get("id").and_then(Value::as_u64) {
                        table.next_id = table.next_id.max(id);
                    }
                    table.rows.push(row);
                }
                other => {
                    return Err(ModelError::Serialization(format!(
                        "Seed rows for '{}' must be objects, got {}",
                        collection, other
                    )))
                }
            }
        }
        Ok(())
    }

    /// Snapshot of all rows in a collection
    pub fn rows(&self, collection: &str) -> Vec<Row> {
        self.tables
            .get(collection)
            .map(|table| table.rows.clone())
            .unwrap_or_default()
    }

    /// Number of `find` calls since creation or the last reset
    pub fn find_count(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    /// `find` calls in issue order
    pub fn queries(&self) -> Vec<LoggedQuery> {
        match self.log.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Reset the find counter and query log
    pub fn reset_counters(&self) {
        self.finds.store(0, Ordering::SeqCst);
        match self.log.lock() {
            Ok(mut log) => log.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    async fn enter(&self, collection: &Collection) -> ModelResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.contains(&collection.name) {
            return Err(ModelError::Database(format!(
                "Simulated failure on collection '{}'",
                collection.name
            )));
        }
        Ok(())
    }

    fn record_find(&self, collection: &Collection, filter: &Filter) {
        self.finds.fetch_add(1, Ordering::SeqCst);
        let entry = LoggedQuery {
            collection: collection.name.clone(),
            filter: filter.clone(),
        };
        match self.log.lock() {
            Ok(mut log) => log.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }

    fn check_inq(&self, clause: &Map<String, Value>) -> ModelResult<()> {
        if !self.inq && uses_operator(&Value::Object(clause.clone()), "inq") {
            return Err(ModelError::Database(
                "Connector does not support 'inq' conditions".to_string(),
            ));
        }
        Ok(())
    }

    fn generate_id(table: &mut Table, id_type: PropertyType) -> Value {
        match id_type {
            PropertyType::String => Value::String(uuid::Uuid::new_v4().to_string()),
            _ => {
                table.next_id += 1;
                Value::from(table.next_id)
            }
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &str {
        "memory"
    }

    fn supports_inq(&self) -> bool {
        self.inq
    }

    async fn find(&self, collection: &Collection, filter: &Filter, _options: &QueryOptions) -> ModelResult<Vec<Row>> {
        self.record_find(collection, filter);
        self.enter(collection).await?;
        if let Some(clause) = &filter.where_clause {
            self.check_inq(clause)?;
        }

        let mut rows: Vec<Row> = match self.tables.get(&collection.name) {
            Some(table) => table
                .rows
                .iter()
                .filter(|row| filter.where_clause.as_ref().map_or(true, |w| matches_where(row, w)))
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        if let Some(order) = &filter.order {
            sort_rows(&mut rows, order);
        }
        let skip = filter.skip.unwrap_or(0);
        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut rows: Vec<Row> = rows.into_iter().skip(skip).take(limit).collect();
        if let Some(fields) = &filter.fields {
            for row in rows.iter_mut() {
                project(row, fields);
            }
        }

        trace!("memory find on '{}' returned {} rows", collection.name, rows.len());
        Ok(rows)
    }

    async fn find_by_id(&self, collection: &Collection, id: &Value, _options: &QueryOptions) -> ModelResult<Option<Row>> {
        self.enter(collection).await?;
        Ok(self.tables.get(&collection.name).and_then(|table| {
            table
                .rows
                .iter()
                .find(|row| row_has_id(row, &collection.id_property, id))
                .cloned()
        }))
    }

    async fn create(&self, collection: &Collection, mut data: Row, _options: &QueryOptions) -> ModelResult<Row> {
        self.enter(collection).await?;
        let mut table = self.tables.entry(collection.name.clone()).or_default();

        match data.get(&collection.id_property).filter(|id| !id.is_null()).cloned() {
            Some(id) => {
                if table.rows.iter().any(|row| row_has_id(row, &collection.id_property, &id)) {
                    return Err(ModelError::Database(format!(
                        "Duplicate id {} in collection '{}'",
                        id, collection.name
                    )));
                }
                if let Some(numeric) = id.as_u64() {
                    table.next_id = table.next_id.max(numeric);
                }
            }
            None => {
                let id = Self::generate_id(&mut table, collection.id_type);
                data.insert(collection.id_property.clone(), id);
            }
        }

        table.rows.push(data.clone());
        Ok(data)
    }

    async fn update_attributes(
        &self,
        collection: &Collection,
        id: &Value,
        data: Row,
        _options: &QueryOptions,
    ) -> ModelResult<Row> {
        self.enter(collection).await?;
        let mut table = self
            .tables
            .get_mut(&collection.name)
            .ok_or_else(|| ModelError::NotFound(collection.name.clone()))?;
        let row = table
            .rows
            .iter_mut()
            .find(|row| row_has_id(row, &collection.id_property, id))
            .ok_or_else(|| ModelError::NotFound(collection.name.clone()))?;
        for (key, value) in data {
            row.insert(key, value);
        }
        Ok(row.clone())
    }

    async fn destroy(&self, collection: &Collection, id: &Value, _options: &QueryOptions) -> ModelResult<bool> {
        self.enter(collection).await?;
        Ok(match self.tables.get_mut(&collection.name) {
            Some(mut table) => {
                let before = table.rows.len();
                table.rows.retain(|row| !row_has_id(row, &collection.id_property, id));
                table.rows.len() != before
            }
            None => false,
        })
    }

    async fn destroy_all(
        &self,
        collection: &Collection,
        where_clause: Option<&Row>,
        _options: &QueryOptions,
    ) -> ModelResult<usize> {
        self.enter(collection).await?;
        if let Some(clause) = where_clause {
            self.check_inq(clause)?;
        }
        Ok(match self.tables.get_mut(&collection.name) {
            Some(mut table) => {
                let before = table.rows.len();
                table.rows.retain(|row| !where_clause.map_or(true, |w| matches_where(row, w)));
                before - table.rows.len()
            }
            None => 0,
        })
    }

    async fn count(&self, collection: &Collection, where_clause: Option<&Row>, _options: &QueryOptions) -> ModelResult<usize> {
        self.enter(collection).await?;
        if let Some(clause) = where_clause {
            self.check_inq(clause)?;
        }
        Ok(self
            .tables
            .get(&collection.name)
            .map(|table| {
                table
                    .rows
                    .iter()
                    .filter(|row| where_clause.map_or(true, |w| matches_where(row, w)))
                    .count()
            })
            .unwrap_or(0))
    }
}

fn row_has_id(row: &Row, id_property: &str, id: &Value) -> bool {
    row.get(id_property).map_or(false, |value| loose_eq(Some(value), id))
}

fn uses_operator(value: &Value, operator: &str) -> bool {
    match value {
        Value::Object(map) => map
            .iter()
            .any(|(key, inner)| key == operator || uses_operator(inner, operator)),
        Value::Array(items) => items.iter().any(|item| uses_operator(item, operator)),
        _ => false,
    }
}

/// Evaluate a `where` object against a row
pub(crate) fn matches_where(row: &Row, clause: &Map<String, Value>) -> bool {
    clause.iter().all(|(key, condition)| match key.as_str() {
        "and" => as_clauses(condition).all(|c| matches_where(row, c)),
        "or" => as_clauses(condition).any(|c| matches_where(row, c)),
        field => matches_condition(row.get(field), condition),
    })
}

fn as_clauses(value: &Value) -> impl Iterator<Item = &Map<String, Value>> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn is_operator_object(condition: &Value) -> Option<&Map<String, Value>> {
    condition
        .as_object()
        .filter(|map| !map.is_empty() && map.keys().all(|k| OPERATORS.contains(&k.as_str())))
}

fn matches_condition(value: Option<&Value>, condition: &Value) -> bool {
    let operators = match is_operator_object(condition) {
        Some(operators) => operators,
        None => return loose_eq(value, condition),
    };

    operators.iter().all(|(op, operand)| match op.as_str() {
        "inq" => operand
            .as_array()
            .map_or(false, |set| set.iter().any(|candidate| loose_eq(value, candidate))),
        "nin" => operand
            .as_array()
            .map_or(true, |set| !set.iter().any(|candidate| loose_eq(value, candidate))),
        "neq" => !loose_eq(value, operand),
        "gt" => compare(value, operand) == Some(CmpOrdering::Greater),
        "gte" => matches!(compare(value, operand), Some(CmpOrdering::Greater | CmpOrdering::Equal)),
        "lt" => compare(value, operand) == Some(CmpOrdering::Less),
        "lte" => matches!(compare(value, operand), Some(CmpOrdering::Less | CmpOrdering::Equal)),
        "between" => match operand.as_array().map(Vec::as_slice) {
            Some([low, high]) => {
                matches!(compare(value, low), Some(CmpOrdering::Greater | CmpOrdering::Equal))
                    && matches!(compare(value, high), Some(CmpOrdering::Less | CmpOrdering::Equal))
            }
            _ => false,
        },
        _ => false,
    })
}

/// Equality with numeric comparison and string projection otherwise,
/// so `1` matches both `1.0` and `"1"`
fn loose_eq(value: Option<&Value>, expected: &Value) -> bool {
    match (value, expected) {
        (None, Value::Null) | (Some(Value::Null), Value::Null) => true,
        (None, _) | (Some(Value::Null), _) | (Some(_), Value::Null) => false,
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(actual), expected) => actual.identity() == expected.identity(),
    }
}

fn compare(value: Option<&Value>, operand: &Value) -> Option<CmpOrdering> {
    match (value?, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn sort_value_cmp(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => CmpOrdering::Equal,
        (None, Some(_)) => CmpOrdering::Less,
        (Some(_), None) => CmpOrdering::Greater,
        (Some(a), Some(b)) => compare(Some(a), b).unwrap_or_else(|| a.identity().cmp(&b.identity())),
    }
}

fn sort_rows(rows: &mut [Row], order: &Value) {
    let keys: Vec<(String, bool)> = match order {
        Value::String(single) => vec![parse_order(single)],
        Value::Array(items) => items.iter().filter_map(Value::as_str).map(parse_order).collect(),
        _ => return,
    };

    rows.sort_by(|a, b| {
        for (field, descending) in &keys {
            let ordering = sort_value_cmp(a.get(field), b.get(field));
            let ordering = if *descending { ordering.reverse() } else { ordering };
            if ordering != CmpOrdering::Equal {
                return ordering;
            }
        }
        CmpOrdering::Equal
    });
}

fn parse_order(spec: &str) -> (String, bool) {
    let mut parts = spec.split_whitespace();
    let field = parts.next().unwrap_or_default().to_string();
    let descending = parts
        .next()
        .map_or(false, |direction| direction.eq_ignore_ascii_case("desc"));
    (field, descending)
}

fn project(row: &mut Row, fields: &Value) {
    match fields {
        Value::Array(names) => {
            let keep: Vec<&str> = names.iter().filter_map(Value::as_str).collect();
            row.retain(|key, _| keep.contains(&key.as_str()));
        }
        Value::String(single) => row.retain(|key, _| key == single),
        Value::Object(flags) => {
            let inclusive = flags.values().any(|v| v.as_bool() == Some(true));
            if inclusive {
                row.retain(|key, _| flags.get(key).and_then(Value::as_bool) == Some(true));
            } else {
                row.retain(|key, _| flags.get(key).and_then(Value::as_bool) != Some(false));
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collection(name: &str) -> Collection {
        Collection::new(name, "id", PropertyType::Number)
    }

    fn object(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    async fn seeded() -> MemoryConnector {
        let connector = MemoryConnector::new();
        connector
            .seed(
                "Post",
                vec![
                    json!({ "id": 1, "title": "b", "userId": 1, "rank": 3 }),
                    json!({ "id": 2, "title": "a", "userId": 1, "rank": 1 }),
                    json!({ "id": 3, "title": "c", "userId": "2", "rank": 2 }),
                    json!({ "id": 4, "title": "d", "userId": null }),
                ],
            )
            .unwrap();
        connector
    }

    async fn titles(connector: &MemoryConnector, filter: Filter) -> Vec<String> {
        connector
            .find(&collection("Post"), &filter, &QueryOptions::new())
            .await
            .unwrap()
            .into_iter()
            .filter_map(|row| row.get("title").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_inq_with_loose_equality() {
        let connector = seeded().await;
        let filter = Filter::new().where_in("userId", vec![json!(2), json!("1")]);
        assert_eq!(titles(&connector, filter).await, vec!["b", "a", "c"]);
        assert_eq!(connector.find_count(), 1);
    }

    #[tokio::test]
    async fn test_operators_and_logic() {
        let connector = seeded().await;
        let filter = Filter::from_value(json!({
            "where": { "or": [{ "rank": { "gte": 3 } }, { "rank": { "between": [1, 1] } }] }
        }))
        .unwrap();
        assert_eq!(titles(&connector, filter).await, vec!["b", "a"]);

        let filter = Filter::from_value(json!({ "where": { "userId": null } })).unwrap();
        assert_eq!(titles(&connector, filter).await, vec!["d"]);

        let filter = Filter::from_value(json!({ "where": { "id": { "nin": [1, 2], "neq": 4 } } })).unwrap();
        assert_eq!(titles(&connector, filter).await, vec!["c"]);
    }

    #[tokio::test]
    async fn test_order_skip_limit_fields() {
        let connector = seeded().await;
        let filter = Filter::new().order("title DESC").skip(1).limit(2);
        assert_eq!(titles(&connector, filter).await, vec!["c", "b"]);

        let rows = connector
            .find(&collection("Post"), &Filter::new().fields(json!(["title"])).limit(1), &QueryOptions::new())
            .await
            .unwrap();
        assert_eq!(rows, vec![object(json!({ "title": "b" }))]);
    }

    #[tokio::test]
    async fn test_without_inq_rejects_membership_queries() {
        let connector = MemoryConnector::new().without_inq();
        assert!(!connector.supports_inq());
        let result = connector
            .find(&collection("Post"), &Filter::new().where_in("id", vec![json!(1)]), &QueryOptions::new())
            .await;
        assert!(matches!(result, Err(ModelError::Database(_))));
    }

    #[tokio::test]
    async fn test_create_generates_ids() {
        let connector = seeded().await;
        let created = connector
            .create(&collection("Post"), object(json!({ "title": "e" })), &QueryOptions::new())
            .await
            .unwrap();
        assert_eq!(created.get("id"), Some(&json!(5)));

        let tags = Collection::new("Tag", "id", PropertyType::String);
        let tag = connector
            .create(&tags, object(json!({ "name": "rust" })), &QueryOptions::new())
            .await
            .unwrap();
        assert!(tag.get("id").and_then(Value::as_str).is_some());

        let duplicate = connector
            .create(&collection("Post"), object(json!({ "id": 1 })), &QueryOptions::new())
            .await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_update_destroy_count() {
        let connector = seeded().await;
        let posts = collection("Post");
        let options = QueryOptions::new();

        let updated = connector
            .update_attributes(&posts, &json!(2), object(json!({ "title": "z" })), &options)
            .await
            .unwrap();
        assert_eq!(updated.get("title"), Some(&json!("z")));

        let by_user = object(json!({ "userId": 1 }));
        assert_eq!(connector.count(&posts, Some(&by_user), &options).await.unwrap(), 2);
        assert!(connector.destroy(&posts, &json!(1), &options).await.unwrap());
        assert!(!connector.destroy(&posts, &json!(1), &options).await.unwrap());
        assert_eq!(connector.destroy_all(&posts, None, &options).await.unwrap(), 3);
        assert_eq!(connector.count(&posts, None, &options).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_injection_and_query_log() {
        let connector = seeded().await;
        connector.fail_on("Post");
        let result = connector
            .find(&collection("Post"), &Filter::new(), &QueryOptions::new())
            .await;
        assert!(matches!(result, Err(ModelError::Database(_))));

        connector.recover("Post");
        connector.reset_counters();
        let _ = titles(&connector, Filter::new().where_eq("userId", 1)).await;
        let log = connector.queries();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].collection, "Post");
    }
}
