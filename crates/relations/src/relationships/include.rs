//! Include specifications
//!
//! An include spec names the relations to resolve along with a query and
//! optionally nested includes. Accepted JSON forms:
//!
//! - `"posts"` or `"posts.comments"` (dotted paths nest)
//! - `["posts", "passport"]`
//! - `{"posts": "comments"}` (relation name to nested spec)
//! - `{"relation": "posts", "scope": {"where": {...}, "include": "comments"}}`
//!
//! Array entries and map values may use any of these forms.

use std::convert::TryFrom;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{ModelError, ModelResult};
use crate::filter::Filter;

/// One relation to include
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IncludeNode {
    pub relation: String,
    /// Per-include query merged into the relation scope
    pub scope: Option<Filter>,
    /// Includes to resolve on the related records
    pub include: Option<IncludeSpec>,
}

impl IncludeNode {
    pub fn new(relation: &str) -> Self {
        Self {
            relation: relation.to_string(),
            ..Self::default()
        }
    }

    pub fn with_scope(mut self, scope: Filter) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_include(mut self, include: IncludeSpec) -> Self {
        self.include = Some(include);
        self
    }
}

/// A parsed include tree
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(try_from = "Value")]
pub struct IncludeSpec {
    pub nodes: Vec<IncludeNode>,
}

impl IncludeSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include a single relation
    pub fn relation(name: &str) -> Self {
        let mut spec = Self::new();
        spec.push(IncludeNode::new(name));
        spec
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node. Unscoped nodes naming the same relation are merged, so
    /// `["posts", "posts.comments"]` resolves `posts` once.
    pub fn push(&mut self, node: IncludeNode) {
        if node.scope.is_none() {
            if let Some(existing) = self
                .nodes
                .iter_mut()
                .find(|n| n.relation == node.relation && n.scope.is_none())
            {
                if let Some(nested) = node.include {
                    match existing.include.as_mut() {
                        Some(current) => current.extend(nested),
                        None => existing.include = Some(nested),
                    }
                }
                return;
            }
        }
        self.nodes.push(node);
    }

    pub fn extend(&mut self, other: IncludeSpec) {
        for node in other.nodes {
            self.push(node);
        }
    }

    /// Nesting depth: 0 for an empty spec, 1 for flat relation lists
    pub fn depth(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| 1 + node.include.as_ref().map_or(0, IncludeSpec::depth))
            .max()
            .unwrap_or(0)
    }

    /// Parse an include spec from JSON
    pub fn from_value(value: &Value) -> ModelResult<Self> {
        let mut spec = Self::new();
        spec.parse_into(value)?;
        Ok(spec)
    }

    fn parse_into(&mut self, value: &Value) -> ModelResult<()> {
        match value {
            Value::Null => Ok(()),
            Value::String(path) => {
                self.push(path_node(path)?);
                Ok(())
            }
            Value::Array(items) => {
                for item in items {
                    self.parse_into(item)?;
                }
                Ok(())
            }
            Value::Object(map) if map.contains_key("relation") => {
                self.push(scoped_node(map)?);
                Ok(())
            }
            Value::Object(map) => {
                for (relation, nested) in map {
                    let node = match nested {
                        Value::Object(inner) if inner.contains_key("relation") => {
                            // `{"posts": {"relation": "posts", "scope": ...}}`
                            let node = scoped_node(inner)?;
                            if node.relation != *relation {
                                return Err(ModelError::Validation(format!(
                                    "Include key '{}' does not match relation '{}'",
                                    relation, node.relation
                                )));
                            }
                            node
                        }
                        other => {
                            let nested = IncludeSpec::from_value(other)?;
                            let mut node = path_node(relation)?;
                            if !nested.is_empty() {
                                attach_leaf(&mut node, nested);
                            }
                            node
                        }
                    };
                    self.push(node);
                }
                Ok(())
            }
            other => Err(ModelError::Validation(format!(
                "Invalid include specification: {}",
                other
            ))),
        }
    }
}

impl TryFrom<Value> for IncludeSpec {
    type Error = ModelError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        IncludeSpec::from_value(&value)
    }
}

impl From<&str> for IncludeSpec {
    fn from(path: &str) -> Self {
        let mut spec = IncludeSpec::new();
        if let Ok(node) = path_node(path) {
            spec.push(node);
        }
        spec
    }
}

/// `"a.b.c"` → a { include: b { include: c } }
fn path_node(path: &str) -> ModelResult<IncludeNode> {
    let mut segments = path.split('.').map(str::trim).rev();
    let leaf = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ModelError::Validation(format!("Invalid include path '{}'", path)))?;

    let mut node = IncludeNode::new(leaf);
    for segment in segments {
        if segment.is_empty() {
            return Err(ModelError::Validation(format!("Invalid include path '{}'", path)));
        }
        let mut inner = IncludeSpec::new();
        inner.push(node);
        node = IncludeNode::new(segment).with_include(inner);
    }
    Ok(node)
}

/// Hang `nested` below the deepest node of a dotted path
fn attach_leaf(node: &mut IncludeNode, nested: IncludeSpec) {
    match node.include.as_mut().and_then(|spec| spec.nodes.first_mut()) {
        Some(child) => attach_leaf(child, nested),
        None => node.include = Some(nested),
    }
}

fn scoped_node(map: &Map<String, Value>) -> ModelResult<IncludeNode> {
    let relation = map
        .get("relation")
        .and_then(Value::as_str)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ModelError::Validation("Include 'relation' must be a non-empty string".to_string()))?;

    let mut node = IncludeNode::new(relation);
    match map.get("scope") {
        None | Some(Value::Null) => {}
        Some(scope @ Value::Object(_)) => {
            let mut filter = Filter::from_value(scope.clone())
                .map_err(|e| ModelError::Validation(format!("Invalid include scope for '{}': {}", relation, e)))?;
            if let Some(nested) = filter.include.take() {
                let nested = IncludeSpec::from_value(&nested)?;
                if !nested.is_empty() {
                    node.include = Some(nested);
                }
            }
            if !filter.is_empty() {
                node.scope = Some(filter);
            }
        }
        Some(other) => {
            return Err(ModelError::Validation(format!(
                "Include scope for '{}' must be an object, got {}",
                relation, other
            )))
        }
    }
    Ok(node)
}
