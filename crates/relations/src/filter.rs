//! Query filters passed through to connectors
//!
//! The filter grammar belongs to the connectors. The relation core only needs
//! a typed shell around it: it reads `include`, merges `where` objects with
//! logical AND, strips paging for batched fetches and adds `inq` conditions.
//! Everything else is carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A materialized row as exchanged with connectors
pub type Row = Map<String, Value>;

/// Connector filter object (`where`, `order`, `limit`, `skip`, `fields`, `include`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    #[serde(default, alias = "offset", skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Value>,
}

impl Filter {
    /// Create an empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a filter from its JSON form
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Add an equality condition (ANDed with the existing `where`)
    pub fn where_eq(self, field: &str, value: impl Into<Value>) -> Self {
        let mut condition = Map::new();
        condition.insert(field.to_string(), value.into());
        self.and_where(condition)
    }

    /// Add an `inq` membership condition (ANDed with the existing `where`)
    pub fn where_in(self, field: &str, values: Vec<Value>) -> Self {
        self.and_where(in_set(field, values))
    }

    /// AND a `where` object into this filter
    pub fn and_where(mut self, condition: Map<String, Value>) -> Self {
        self.where_clause = combine_where(self.where_clause.take(), Some(condition));
        self
    }

    /// Set the order clause
    pub fn order(mut self, order: impl Into<Value>) -> Self {
        self.order = Some(order.into());
        self
    }

    /// Set the limit
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the number of rows to skip
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Set the field projection
    pub fn fields(mut self, fields: impl Into<Value>) -> Self {
        self.fields = Some(fields.into());
        self
    }

    /// Set the include spec
    pub fn include(mut self, include: impl Into<Value>) -> Self {
        self.include = Some(include.into());
        self
    }

    /// Check whether the filter carries no conditions at all
    pub fn is_empty(&self) -> bool {
        self.where_clause.as_ref().map_or(true, |w| w.is_empty())
            && self.order.is_none()
            && self.limit.is_none()
            && self.skip.is_none()
            && self.fields.is_none()
            && self.include.is_none()
    }

    /// Merge `overlay` on top of this filter.
    ///
    /// Every clause is last-wins except `where`, which is combined with AND.
    pub fn merge(mut self, overlay: &Filter) -> Filter {
        self.where_clause = combine_where(self.where_clause.take(), overlay.where_clause.clone());
        if overlay.order.is_some() {
            self.order = overlay.order.clone();
        }
        if overlay.limit.is_some() {
            self.limit = overlay.limit;
        }
        if overlay.skip.is_some() {
            self.skip = overlay.skip;
        }
        if overlay.fields.is_some() {
            self.fields = overlay.fields.clone();
        }
        if overlay.include.is_some() {
            self.include = overlay.include.clone();
        }
        self
    }

    /// Remove paging, returning it as `(limit, skip)`
    pub fn take_paging(&mut self) -> (Option<usize>, Option<usize>) {
        (self.limit.take(), self.skip.take())
    }

    /// Make sure a projection keeps `field`, so rows can still be joined
    pub fn ensure_field(&mut self, field: &str) {
        match self.fields.as_mut() {
            Some(Value::Array(names)) => {
                if !names.iter().any(|n| n.as_str() == Some(field)) {
                    names.push(Value::String(field.to_string()));
                }
            }
            Some(Value::Object(flags)) => {
                let inclusive = flags.values().any(|v| v.as_bool() == Some(true));
                if inclusive {
                    flags.insert(field.to_string(), Value::Bool(true));
                } else {
                    flags.remove(field);
                }
            }
            Some(Value::String(single)) => {
                if single != field {
                    let names = vec![Value::String(single.clone()), Value::String(field.to_string())];
                    self.fields = Some(Value::Array(names));
                }
            }
            _ => {}
        }
    }

    /// Stable string form of the filter, used to group identical scopes
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Build a `{field: {inq: [...]}}` condition
pub fn in_set(field: &str, values: Vec<Value>) -> Map<String, Value> {
    let mut inq = Map::new();
    inq.insert("inq".to_string(), Value::Array(values));
    let mut condition = Map::new();
    condition.insert(field.to_string(), Value::Object(inq));
    condition
}

/// Combine two `where` objects with logical AND.
///
/// Objects with disjoint keys are merged directly (keys of a `where` object
/// are already ANDed); overlapping keys are wrapped in `{"and": [a, b]}`.
pub fn combine_where(
    base: Option<Map<String, Value>>,
    overlay: Option<Map<String, Value>>,
) -> Option<Map<String, Value>> {
    match (base, overlay) {
        (None, None) => None,
        (Some(w), None) | (None, Some(w)) => Some(w),
        (Some(a), Some(b)) if a.is_empty() => Some(b),
        (Some(a), Some(b)) if b.is_empty() => Some(a),
        (Some(mut a), Some(b)) => {
            if b.keys().any(|k| a.contains_key(k)) {
                let mut and = Map::new();
                and.insert(
                    "and".to_string(),
                    Value::Array(vec![Value::Object(a), Value::Object(b)]),
                );
                Some(and)
            } else {
                a.extend(b);
                Some(a)
            }
        }
    }
}

/// Opaque per-call options forwarded to connectors untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryOptions(pub Map<String, Value>);

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_filter_roundtrips_where_keyword() {
        let filter = Filter::from_value(json!({
            "where": { "published": true },
            "order": "title ASC",
            "offset": 5,
            "include": "comments"
        }))
        .unwrap();

        assert_eq!(filter.where_clause, Some(object(json!({ "published": true }))));
        assert_eq!(filter.skip, Some(5));
        assert_eq!(filter.include, Some(json!("comments")));

        let back = serde_json::to_value(&filter).unwrap();
        assert_eq!(back["where"], json!({ "published": true }));
        assert_eq!(back["skip"], json!(5));
        assert!(back.get("limit").is_none());
    }

    #[test]
    fn test_combine_where_disjoint_keys_merge() {
        let merged = combine_where(
            Some(object(json!({ "a": 1 }))),
            Some(object(json!({ "b": 2 }))),
        );
        assert_eq!(merged, Some(object(json!({ "a": 1, "b": 2 }))));
    }

    #[test]
    fn test_combine_where_overlapping_keys_use_and() {
        let merged = combine_where(
            Some(object(json!({ "a": 1 }))),
            Some(object(json!({ "a": 2 }))),
        );
        assert_eq!(merged, Some(object(json!({ "and": [{ "a": 1 }, { "a": 2 }] }))));
    }

    #[test]
    fn test_combine_where_empty_sides() {
        assert_eq!(combine_where(None, None), None);
        assert_eq!(
            combine_where(Some(Map::new()), Some(object(json!({ "a": 1 })))),
            Some(object(json!({ "a": 1 })))
        );
    }

    #[test]
    fn test_merge_is_last_wins_except_where() {
        let base = Filter::new().where_eq("kind", "post").order("id ASC").limit(10);
        let overlay = Filter::new().where_eq("published", true).order("id DESC");
        let merged = base.merge(&overlay);

        assert_eq!(
            merged.where_clause,
            Some(object(json!({ "kind": "post", "published": true })))
        );
        assert_eq!(merged.order, Some(json!("id DESC")));
        assert_eq!(merged.limit, Some(10));
    }

    #[test]
    fn test_where_in_builds_inq_condition() {
        let filter = Filter::new().where_in("userId", vec![json!(1), json!(2)]);
        assert_eq!(
            filter.where_clause,
            Some(object(json!({ "userId": { "inq": [1, 2] } })))
        );
    }

    #[test]
    fn test_take_paging() {
        let mut filter = Filter::new().limit(2).skip(1);
        assert_eq!(filter.take_paging(), (Some(2), Some(1)));
        assert!(filter.limit.is_none());
        assert!(filter.skip.is_none());
    }

    #[test]
    fn test_ensure_field_variants() {
        let mut list = Filter::new().fields(json!(["title"]));
        list.ensure_field("userId");
        assert_eq!(list.fields, Some(json!(["title", "userId"])));

        let mut inclusive = Filter::new().fields(json!({ "title": true }));
        inclusive.ensure_field("userId");
        assert_eq!(inclusive.fields, Some(json!({ "title": true, "userId": true })));

        let mut exclusive = Filter::new().fields(json!({ "userId": false, "body": false }));
        exclusive.ensure_field("userId");
        assert_eq!(exclusive.fields, Some(json!({ "body": false })));
    }

    #[test]
    fn test_fingerprint_distinguishes_scopes() {
        let a = Filter::new().where_eq("type", "a");
        let b = Filter::new().where_eq("type", "b");
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
    }
}
