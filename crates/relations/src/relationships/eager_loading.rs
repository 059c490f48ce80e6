//! Eager Loading System - Prevents N+1 query problems with batched include resolution
//!
//! Each include level issues one fetch per relation (per parent group) using
//! an `inq` condition on the join key, regardless of how many parents there
//! are. Results are stitched back with identity maps, nested includes are
//! resolved on the fetched children before they are handed to their parents,
//! and every parent's relation cache receives a value (possibly empty).
//!
//! Through relations take two fetches (join rows, then targets). Embedded
//! relations take none.

use futures::future::{try_join_all, BoxFuture, FutureExt};
use serde_json::Value;

use crate::connector::Collection;
use crate::datasource::DataSource;
use crate::error::{ModelError, ModelResult};
use crate::filter::{Filter, QueryOptions, Row};
use crate::record::Record;
use super::cache::RelationValue;
use super::identity_map::{build_one_to_many, build_one_to_one, join, FieldSource, IdentityMap};
use super::include::{IncludeNode, IncludeSpec};
use super::metadata::{RelationDefinition, RelationType};
use super::scope::{Scope, ScopeComposer};

/// Parents sharing one batched fetch
#[derive(Debug, Clone)]
struct ParentGroup {
    /// Target model chosen per record (polymorphic belongsTo)
    target: Option<String>,
    /// Dynamic scope fragment shared by every member
    fragment: Option<Filter>,
    /// Indexes into the parent record slice
    members: Vec<usize>,
}

/// Query and post-processing for one group fetch
#[derive(Debug, Clone)]
struct FetchPlan {
    filter: Filter,
    limit: Option<usize>,
    skip: Option<usize>,
    include: Option<IncludeSpec>,
}

impl FetchPlan {
    /// Apply the include scope's paging to one parent's children
    fn page(&self, children: Vec<Record>) -> Vec<Record> {
        let skip = self.skip.unwrap_or(0);
        match self.limit {
            Some(limit) => children.into_iter().skip(skip).take(limit).collect(),
            None => children.into_iter().skip(skip).collect(),
        }
    }
}

/// Resolves include specs against a data source
pub struct IncludeResolver<'a> {
    source: &'a DataSource,
    options: &'a QueryOptions,
}

impl<'a> IncludeResolver<'a> {
    pub fn new(source: &'a DataSource, options: &'a QueryOptions) -> Self {
        Self { source, options }
    }

    /// Resolve `spec` for `records` of `model`, filling each record's relation cache
    pub async fn resolve(&self, model: &str, records: &mut [Record], spec: &IncludeSpec) -> ModelResult<()> {
        if spec.is_empty() || records.is_empty() {
            return Ok(());
        }

        let max_depth = self.source.config().max_depth;
        if spec.depth() > max_depth {
            return Err(ModelError::Validation(format!(
                "Include depth {} exceeds the maximum of {}",
                spec.depth(),
                max_depth
            )));
        }

        self.include_level(model, records, spec, 1).await
    }

    fn include_level<'r>(
        &'r self,
        model: &'r str,
        records: &'r mut [Record],
        spec: &'r IncludeSpec,
        depth: usize,
    ) -> BoxFuture<'r, ModelResult<()>> {
        async move {
            let max_depth = self.source.config().max_depth;
            if depth > max_depth {
                return Err(ModelError::Validation(format!(
                    "Include depth exceeds the maximum of {}",
                    max_depth
                )));
            }
            if records.is_empty() || spec.is_empty() {
                return Ok(());
            }

            let shared: &[Record] = records;
            let results = if self.source.config().parallel_branches && spec.nodes.len() > 1 {
                try_join_all(
                    spec.nodes
                        .iter()
                        .map(|node| self.resolve_node(model, shared, node, depth)),
                )
                .await?
            } else {
                let mut results = Vec::with_capacity(spec.nodes.len());
                for node in &spec.nodes {
                    results.push(self.resolve_node(model, shared, node, depth).await?);
                }
                results
            };

            for (node, values) in spec.nodes.iter().zip(results) {
                if let Some(values) = values {
                    for (record, value) in records.iter_mut().zip(values) {
                        record.set_relation(&node.relation, value);
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Resolve one include node; `None` when the node is skipped
    async fn resolve_node(
        &self,
        model: &str,
        records: &[Record],
        node: &IncludeNode,
        depth: usize,
    ) -> ModelResult<Option<Vec<RelationValue>>> {
        let relation = match self.source.relation(model, &node.relation)? {
            Some(relation) if relation.is_includable() => relation,
            Some(_) => {
                tracing::trace!("Skipping include of '{}.{}': disabled", model, node.relation);
                return Ok(None);
            }
            None => {
                tracing::trace!("Skipping include of '{}.{}': no such relation", model, node.relation);
                return Ok(None);
            }
        };

        self.load_relation(&relation, records, node, depth).await.map(Some)
    }

    /// Load `relation` for every record, returning one value per record in order
    pub(crate) async fn load_relation(
        &self,
        relation: &RelationDefinition,
        records: &[Record],
        node: &IncludeNode,
        depth: usize,
    ) -> ModelResult<Vec<RelationValue>> {
        let mut values: Vec<RelationValue> = records
            .iter()
            .map(|_| RelationValue::empty(relation.multiple))
            .collect();

        for group in group_parents(relation, records) {
            let plan = build_plan(relation, &group, node)?;
            match relation.kind {
                RelationType::BelongsTo => {
                    self.load_belongs_to(relation, records, &group, &plan, &mut values, depth)
                        .await?
                }
                RelationType::HasMany | RelationType::HasOne => {
                    self.load_has_many(relation, records, &group, &plan, &mut values, depth)
                        .await?
                }
                RelationType::HasManyThrough | RelationType::HasAndBelongsToMany => {
                    self.load_through(relation, records, &group, &plan, &mut values, depth)
                        .await?
                }
                RelationType::ReferencesMany => {
                    self.load_references_many(relation, records, &group, &plan, &mut values, depth)
                        .await?
                }
                RelationType::EmbedsOne | RelationType::EmbedsMany => {
                    self.load_embedded(relation, records, &group, &plan, &mut values, depth)
                        .await?
                }
            }
        }

        Ok(values)
    }

    async fn load_belongs_to(
        &self,
        relation: &RelationDefinition,
        records: &[Record],
        group: &ParentGroup,
        plan: &FetchPlan,
        values: &mut [RelationValue],
        depth: usize,
    ) -> ModelResult<()> {
        let target = match group.target.as_deref() {
            Some(target) => target,
            None => relation.target_model()?,
        };
        let collection = self.source.collection(target)?;
        // polymorphic targets are joined on their own primary key
        let key_to = if relation.is_polymorphic_belongs_to() {
            collection.id_property.clone()
        } else {
            relation.key_to.clone()
        };

        let keys = group
            .members
            .iter()
            .filter_map(|&i| key_value(&records[i], &relation.key_from).cloned())
            .collect();
        let mut children = self
            .fetch_records(&collection, &key_to, keys, &plan.filter, &relation.name)
            .await?;
        self.resolve_nested(target, &mut children, plan, depth).await?;

        let by_key = build_one_to_one(children, &key_to);
        for &i in &group.members {
            let child = key_value(&records[i], &relation.key_from)
                .and_then(|key| by_key.get(key))
                .cloned();
            values[i] = RelationValue::one(child);
        }
        Ok(())
    }

    async fn load_has_many(
        &self,
        relation: &RelationDefinition,
        records: &[Record],
        group: &ParentGroup,
        plan: &FetchPlan,
        values: &mut [RelationValue],
        depth: usize,
    ) -> ModelResult<()> {
        let target = relation.target_model()?;
        let collection = self.source.collection(target)?;

        let parents = index_parents(records, &group.members, &relation.key_from);
        let keys = parents.get_keys().into_iter().cloned().collect();
        let mut children = self
            .fetch_records(&collection, &relation.key_to, keys, &plan.filter, &relation.name)
            .await?;
        self.resolve_nested(target, &mut children, plan, depth).await?;

        let buckets = build_one_to_many(children, &relation.key_to);
        join(&parents, &buckets, |members, kids| {
            let paged = plan.page(kids.to_vec());
            for &i in members {
                values[i] = if relation.multiple {
                    RelationValue::many(paged.clone())
                } else {
                    RelationValue::one(paged.first().cloned())
                };
            }
        });
        Ok(())
    }

    async fn load_through(
        &self,
        relation: &RelationDefinition,
        records: &[Record],
        group: &ParentGroup,
        plan: &FetchPlan,
        values: &mut [RelationValue],
        depth: usize,
    ) -> ModelResult<()> {
        let through = relation.through.as_ref().ok_or_else(|| {
            ModelError::Relationship(format!("Relation '{}' has no through model", relation.name))
        })?;
        let target = relation.target_model()?;
        let through_collection = self.source.collection(&through.model)?;
        let target_collection = self.source.collection(target)?;
        // no belongsTo to the target: join on its id property
        let target_key = match self.source.relation(&through.model, &through.collect)? {
            Some(collect) if collect.kind == RelationType::BelongsTo => collect.key_to.clone(),
            _ => target_collection.id_property.clone(),
        };

        let parents = index_parents(records, &group.members, &relation.key_from);
        let keys = parents.get_keys().into_iter().cloned().collect();
        let through_rows = self
            .fetch_rows(&through_collection, &relation.key_to, keys, &Filter::new(), &relation.name)
            .await?;
        let links = build_one_to_many(through_rows, &relation.key_to);

        let target_keys = links
            .iter()
            .flat_map(|(_, rows)| rows.iter())
            .filter_map(|row| key_value(row, &through.key_through).cloned())
            .collect();
        let mut children = self
            .fetch_records(&target_collection, &target_key, target_keys, &plan.filter, &relation.name)
            .await?;
        self.resolve_nested(target, &mut children, plan, depth).await?;

        join(&parents, &links, |members, link_rows| {
            let mut wanted: IdentityMap<Value, ()> = IdentityMap::with_capacity(link_rows.len());
            for row in link_rows {
                if let Some(key) = key_value(row, &through.key_through) {
                    wanted.set(key.clone(), ());
                }
            }
            // keep the target fetch order so the scope's `order` holds per parent
            let kids: Vec<Record> = children
                .iter()
                .filter(|child| key_value(*child, &target_key).map_or(false, |k| wanted.exists(k)))
                .cloned()
                .collect();
            let paged = plan.page(kids);
            for &i in members {
                values[i] = RelationValue::many(paged.clone());
            }
        });
        Ok(())
    }

    async fn load_references_many(
        &self,
        relation: &RelationDefinition,
        records: &[Record],
        group: &ParentGroup,
        plan: &FetchPlan,
        values: &mut [RelationValue],
        depth: usize,
    ) -> ModelResult<()> {
        let target = relation.target_model()?;
        let collection = self.source.collection(target)?;

        let keys = group
            .members
            .iter()
            .flat_map(|&i| referenced_ids(&records[i], &relation.key_from))
            .collect();
        let mut children = self
            .fetch_records(&collection, &relation.key_to, keys, &plan.filter, &relation.name)
            .await?;
        self.resolve_nested(target, &mut children, plan, depth).await?;

        let by_key = build_one_to_one(children, &relation.key_to);
        for &i in &group.members {
            let ordered = referenced_ids(&records[i], &relation.key_from)
                .iter()
                .filter_map(|id| by_key.get(id).cloned())
                .collect();
            values[i] = RelationValue::many(plan.page(ordered));
        }
        Ok(())
    }

    async fn load_embedded(
        &self,
        relation: &RelationDefinition,
        records: &[Record],
        group: &ParentGroup,
        plan: &FetchPlan,
        values: &mut [RelationValue],
        depth: usize,
    ) -> ModelResult<()> {
        let target = relation.target_model()?;
        let collection = self.source.collection(target)?;

        let mut flat = Vec::new();
        let mut spans = Vec::with_capacity(group.members.len());
        for &i in &group.members {
            let start = flat.len();
            flat.extend(
                embedded_rows(&records[i], &relation.key_from)
                    .into_iter()
                    .map(|row| Record::new(target, row).with_id_property(&collection.id_property)),
            );
            spans.push((i, start, flat.len()));
        }

        // nested includes run once over the embedded items of every parent
        self.resolve_nested(target, &mut flat, plan, depth).await?;

        for (i, start, end) in spans {
            let items = flat[start..end].to_vec();
            values[i] = if relation.multiple {
                RelationValue::many(plan.page(items))
            } else {
                RelationValue::one(items.into_iter().next())
            };
        }
        Ok(())
    }

    async fn resolve_nested(
        &self,
        model: &str,
        children: &mut Vec<Record>,
        plan: &FetchPlan,
        depth: usize,
    ) -> ModelResult<()> {
        match &plan.include {
            Some(nested) if !nested.is_empty() && !children.is_empty() => {
                self.include_level(model, children, nested, depth + 1).await
            }
            _ => Ok(()),
        }
    }

    async fn fetch_records(
        &self,
        collection: &Collection,
        field: &str,
        keys: Vec<Value>,
        base: &Filter,
        relation: &str,
    ) -> ModelResult<Vec<Record>> {
        let rows = self.fetch_rows(collection, field, keys, base, relation).await?;
        Ok(rows
            .into_iter()
            .map(|row| Record::persisted(&collection.name, &collection.id_property, row))
            .collect())
    }

    /// Fetch rows whose `field` is in `keys`, merged with `base`.
    ///
    /// No query is issued for an empty key set. Key sets larger than the
    /// configured in-set limit are split into several queries; connectors
    /// without `inq` support get one equality query per key.
    async fn fetch_rows(
        &self,
        collection: &Collection,
        field: &str,
        keys: Vec<Value>,
        base: &Filter,
        relation: &str,
    ) -> ModelResult<Vec<Row>> {
        let mut unique: IdentityMap<Value, ()> = IdentityMap::with_capacity(keys.len());
        for key in keys.into_iter().filter(|k| !k.is_null()) {
            unique.set(key, ());
        }
        if unique.is_empty() {
            tracing::trace!("No keys to fetch for relation '{}'", relation);
            return Ok(Vec::new());
        }
        let keys: Vec<Value> = unique.get_keys().into_iter().cloned().collect();

        let mut filter = base.clone();
        filter.include = None;
        filter.ensure_field(field);

        let connector = self.source.connector();
        let mut rows = Vec::new();

        if !connector.supports_inq() {
            tracing::warn!(
                "Connector '{}' lacks 'inq' support, fetching relation '{}' with {} queries",
                connector.name(),
                relation,
                keys.len()
            );
            for key in keys {
                let query = filter.clone().where_eq(field, key);
                rows.extend(connector.find(collection, &query, self.options).await?);
            }
            return Ok(rows);
        }

        let chunk_size = self
            .source
            .config()
            .in_set_limit
            .unwrap_or(keys.len())
            .max(1);
        for chunk in keys.chunks(chunk_size) {
            tracing::debug!(
                "Fetching '{}' for relation '{}' with {} keys",
                collection.name,
                relation,
                chunk.len()
            );
            let query = filter.clone().where_in(field, chunk.to_vec());
            rows.extend(connector.find(collection, &query, self.options).await?);
        }
        Ok(rows)
    }
}

fn key_value<'r, R: FieldSource>(record: &'r R, field: &str) -> Option<&'r Value> {
    record.field(field).filter(|value| !value.is_null())
}

/// Parent indexes keyed by their join key value
fn index_parents(records: &[Record], members: &[usize], field: &str) -> IdentityMap<Value, Vec<usize>> {
    let mut parents = IdentityMap::with_capacity(members.len());
    for &i in members {
        if let Some(key) = key_value(&records[i], field) {
            parents.push(key.clone(), i);
        }
    }
    parents
}

/// Ids held by a referencesMany property, in stored order
fn referenced_ids(record: &Record, field: &str) -> Vec<Value> {
    match record.get(field) {
        Some(Value::Array(ids)) => ids.iter().filter(|id| !id.is_null()).cloned().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(single) => vec![single.clone()],
    }
}

/// Inline documents held by an embedded property
fn embedded_rows(record: &Record, field: &str) -> Vec<Row> {
    match record.get(field) {
        Some(Value::Object(row)) => vec![row.clone()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_object).cloned().collect(),
        _ => Vec::new(),
    }
}

/// Partition parents by per-record target model and dynamic scope fragment
fn group_parents(relation: &RelationDefinition, records: &[Record]) -> Vec<ParentGroup> {
    let dynamic = matches!(relation.scope, Some(Scope::Dynamic(_)));
    if !dynamic && !relation.is_polymorphic_belongs_to() {
        return vec![ParentGroup {
            target: None,
            fragment: None,
            members: (0..records.len()).collect(),
        }];
    }

    let composer = ScopeComposer::new(relation);
    let mut groups: IdentityMap<String, ParentGroup> = IdentityMap::new();
    for (i, record) in records.iter().enumerate() {
        let target = match &relation.polymorphic {
            Some(polymorphic) if relation.kind == RelationType::BelongsTo => {
                match record.get(&polymorphic.discriminator).and_then(Value::as_str) {
                    Some(target) => Some(target.to_string()),
                    // no discriminator: nothing to load for this parent
                    None => continue,
                }
            }
            _ => None,
        };
        let fragment = composer.dynamic_scope(record);
        let key = format!(
            "{}|{}",
            target.as_deref().unwrap_or_default(),
            fragment.as_ref().map(Filter::fingerprint).unwrap_or_default()
        );
        match groups.get_mut(&key) {
            Some(group) => group.members.push(i),
            None => {
                groups.set(
                    key,
                    ParentGroup {
                        target,
                        fragment,
                        members: vec![i],
                    },
                );
            }
        }
    }
    groups.iter().map(|(_, group)| group.clone()).collect()
}

fn build_plan(relation: &RelationDefinition, group: &ParentGroup, node: &IncludeNode) -> ModelResult<FetchPlan> {
    let mut filter = ScopeComposer::new(relation).for_batch(group.fragment.as_ref(), node.scope.as_ref());
    let (limit, skip) = filter.take_paging();

    let mut include = node.include.clone();
    if let Some(scoped) = filter.include.take() {
        let scoped = IncludeSpec::from_value(&scoped)?;
        match include.as_mut() {
            Some(current) => current.extend(scoped),
            None => include = Some(scoped),
        }
    }

    Ok(FetchPlan {
        filter,
        limit,
        skip,
        include,
    })
}
