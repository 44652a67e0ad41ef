//! The normalized cache facade.
//!
//! Every mutating call records what it touched in a pending [`ChangeSet`].
//! Callers group the writes of one logical state transition and then call
//! [`NormalizedCache::flush`] once, which rebuilds stale optimistic layers
//! and hands back the batched changes for notification.

use crate::entity_store::EntityStore;
use crate::error::{StoreError, StoreResult};
use crate::materialize::{EntitySource, Materialized, Materializer};
use crate::normalize::{normalize, normalize_root};
use crate::overlay::{OptimisticLayer, OptimisticRecipe, OverlayLayer, ReconcileFn};
use crate::query_cache::{QueryCache, QueryRoot};
use crate::txn::{CacheTxn, TxnTarget};
use optistack_model::{EntityRecord, Fragment, QueryDocument, SchemaRegistry};
use optistack_types::{EntityKey, MutationId, QueryKey};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Which data a read observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadBound {
    /// Canonical records only.
    Canonical,
    /// Canonical records plus overlay layers up to and including this id.
    Upto(MutationId),
    /// Canonical records plus every overlay layer.
    Latest,
}

impl ReadBound {
    fn layer_limit(self) -> Option<Option<MutationId>> {
        match self {
            Self::Canonical => None,
            Self::Upto(id) => Some(Some(id)),
            Self::Latest => Some(None),
        }
    }
}

/// Entities and query roots touched by one state transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub entities: BTreeSet<EntityKey>,
    pub queries: BTreeSet<QueryKey>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.queries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len() + self.queries.len()
    }

    pub fn merge(&mut self, other: ChangeSet) {
        self.entities.extend(other.entities);
        self.queries.extend(other.queries);
    }

    pub fn touches_entity(&self, key: &EntityKey) -> bool {
        self.entities.contains(key)
    }

    pub fn touches_query(&self, key: &QueryKey) -> bool {
        self.queries.contains(key)
    }

    /// Whether any of `keys` changed.
    pub fn touches_any<'a>(&self, keys: impl IntoIterator<Item = &'a EntityKey>) -> bool {
        keys.into_iter().any(|k| self.entities.contains(k))
    }
}

/// Canonical store, query cache and optimistic overlay behind one API.
#[derive(Debug)]
pub struct NormalizedCache {
    registry: SchemaRegistry,
    entities: EntityStore,
    queries: QueryCache,
    optimistic: OptimisticLayer,
    changes: ChangeSet,
    /// Canonical data or layer order changed since layers were last built.
    layers_stale: bool,
}

impl NormalizedCache {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            registry,
            entities: EntityStore::new(),
            queries: QueryCache::new(),
            optimistic: OptimisticLayer::new(),
            changes: ChangeSet::default(),
            layers_stale: false,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    pub fn queries(&self) -> &QueryCache {
        &self.queries
    }

    pub fn optimistic(&self) -> &OptimisticLayer {
        &self.optimistic
    }

    /// Read-only view at `bound`.
    pub fn view(&self, bound: ReadBound) -> CacheView<'_> {
        CacheView { cache: self, bound }
    }

    /// Derives the entity key of a response object.
    pub fn identify(&self, value: &Value) -> Option<EntityKey> {
        self.registry.identify_value(value)
    }

    // ── Reads ────────────────────────────────────────────────────

    /// The entity as observers see it: the overlay is preferred over the
    /// canonical record while a layer touches the key.
    pub fn read_entity(&self, key: &EntityKey) -> Option<EntityRecord> {
        self.view(ReadBound::Latest).read_entity(key)
    }

    pub fn read_canonical(&self, key: &EntityKey) -> Option<&EntityRecord> {
        self.entities.read(key)
    }

    pub fn read_query_root(&self, key: &QueryKey) -> Option<QueryRoot> {
        self.view(ReadBound::Latest).read_query_root(key)
    }

    /// Materializes `document` and records the visited entities as the
    /// query's dependencies, whether or not the result was complete.
    pub fn resolve(
        &mut self,
        document: &QueryDocument,
        variables: &Value,
    ) -> StoreResult<Materialized> {
        let key = QueryKey::new(&document.name, variables);
        let (result, dependencies) = self.view(ReadBound::Latest).resolve_tracked(document, variables);
        self.queries.set_dependencies(&key, dependencies.clone());
        result.map(|data| Materialized { data, dependencies })
    }

    /// Materializes `fragment` over a single entity.
    pub fn resolve_fragment(&self, fragment: &Fragment, key: &EntityKey) -> StoreResult<Materialized> {
        self.view(ReadBound::Latest).resolve_fragment(fragment, key)
    }

    pub fn register_dependency(&mut self, query: &QueryKey, entity: &EntityKey) {
        self.queries.register_dependency(query, entity);
    }

    /// Forgets which entities `query` depends on. The root stays cached.
    pub fn release_query(&mut self, query: &QueryKey) {
        self.queries.set_dependencies(query, BTreeSet::new());
    }

    // ── Canonical writes ─────────────────────────────────────────

    /// Upserts a canonical record and returns the queries that depend on it.
    pub fn write_entity(&mut self, record: &EntityRecord) -> BTreeSet<QueryKey> {
        let outcome = self.entities.write(record);
        debug!(key = %outcome.key, changed = outcome.changed_fields.len(), "canonical write");
        self.mark_canonical_entity(&record.key)
    }

    /// Removes a canonical record.
    pub fn evict_entity(&mut self, key: &EntityKey) -> bool {
        let removed = self.entities.remove(key).is_some();
        self.mark_canonical_entity(key);
        removed
    }

    /// Replaces a canonical query root.
    pub fn write_query_root(&mut self, key: QueryKey, root: QueryRoot) {
        self.queries.write_root(key.clone(), root);
        self.mark_canonical_query(key);
    }

    pub fn evict_query(&mut self, key: &QueryKey) -> bool {
        let removed = self.queries.evict(key).is_some();
        self.mark_canonical_query(key.clone());
        removed
    }

    /// Normalizes operation data and writes it canonically: entities into
    /// the entity store, root fields into the query root for `key`.
    pub fn write_query_result(&mut self, key: &QueryKey, data: &Value) -> StoreResult<()> {
        let (root, records) = normalize_root(&self.registry, data)?;
        for record in &records {
            self.write_entity(record);
        }
        self.queries.merge_root(key.clone(), root.fields);
        self.mark_canonical_query(key.clone());
        Ok(())
    }

    /// Writes a committed mutation's server payload. Fields already
    /// committed by a later mutation are left untouched.
    pub fn commit_mutation(&mut self, id: MutationId, data: &Value) -> StoreResult<BTreeSet<QueryKey>> {
        let normalized = normalize(&self.registry, data)?;
        let mut touched = BTreeSet::new();
        for record in &normalized.records {
            let fields: Vec<_> = record
                .fields
                .iter()
                .filter(|(name, _)| !self.optimistic.is_shadowed(id, &record.key, name))
                .collect();
            let names: Vec<String> = fields.iter().map(|(name, _)| (*name).clone()).collect();
            let outcome = self.entities.write_fields(&record.key, fields);
            debug!(mutation = %id, key = %outcome.key, changed = outcome.changed_fields.len(), "commit write");
            self.optimistic.record_commit(id, &record.key, &names);
            touched.extend(self.mark_canonical_entity(&record.key));
        }
        Ok(touched)
    }

    fn mark_canonical_entity(&mut self, key: &EntityKey) -> BTreeSet<QueryKey> {
        self.changes.entities.insert(key.clone());
        self.layers_stale = true;
        self.queries.queries_touching([key])
    }

    fn mark_canonical_query(&mut self, key: QueryKey) {
        self.changes.queries.insert(key);
        self.layers_stale = true;
    }

    // ── Optimistic layer ─────────────────────────────────────────

    /// Registers a dispatched mutation, optimistic or not.
    pub fn begin_mutation(&mut self, id: MutationId) {
        self.optimistic.begin(id);
    }

    /// Adds the overlay layer for mutation `id` and builds it: the optimistic
    /// entities first, then the reconciliation function against the layer.
    ///
    /// A payload that cannot be normalized is rejected before any layer is
    /// created. A failing reconciliation is returned but the layer (with the
    /// writes made so far) stays in place until the mutation settles.
    pub fn push_optimistic(
        &mut self,
        id: MutationId,
        data: Value,
        reconcile: Option<ReconcileFn>,
    ) -> StoreResult<()> {
        let normalized = normalize(&self.registry, &data)?;
        if self.optimistic.ids().last().is_some_and(|last| *last > id) {
            // Later layers were built without this one underneath.
            self.layers_stale = true;
        }
        self.optimistic.insert(OverlayLayer::new(
            id,
            OptimisticRecipe {
                data,
                records: normalized.records,
                reconcile,
            },
        ));
        let result = self.build_layer(id);
        self.mark_layer(id);
        result
    }

    /// Drops the layer of mutation `id`. Returns whether one existed.
    pub fn remove_optimistic(&mut self, id: MutationId) -> bool {
        match self.optimistic.remove(id) {
            Some(layer) => {
                self.changes.entities.extend(layer.touched_entities().cloned());
                self.changes.queries.extend(layer.touched_queries().cloned());
                self.layers_stale = true;
                true
            }
            None => false,
        }
    }

    /// Marks mutation `id` as resolved.
    pub fn settle_mutation(&mut self, id: MutationId) {
        self.optimistic.settle(id);
    }

    pub fn optimistic_layer_count(&self) -> usize {
        self.optimistic.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.optimistic.in_flight_count()
    }

    fn build_layer(&mut self, id: MutationId) -> StoreResult<()> {
        let recipe = match self.optimistic.layer_mut(id) {
            Some(layer) => {
                let recipe = layer.recipe.clone();
                layer.reset();
                for record in &recipe.records {
                    layer.write_entity(record);
                }
                recipe
            }
            None => return Err(StoreError::UnknownLayer(id)),
        };
        match &recipe.reconcile {
            Some(reconcile) => self.reconcile(TxnTarget::Optimistic(id), reconcile, &recipe.data),
            None => Ok(()),
        }
    }

    fn mark_layer(&mut self, id: MutationId) {
        if let Some(layer) = self.optimistic.layer(id) {
            self.changes.entities.extend(layer.touched_entities().cloned());
            self.changes.queries.extend(layer.touched_queries().cloned());
        }
    }

    /// Replays every layer in sequence order over the current canonical
    /// data.
    fn rebuild_layers(&mut self) {
        for id in self.optimistic.ids() {
            // Keys touched before and after the replay both need refreshing.
            self.mark_layer(id);
            if let Err(e) = self.build_layer(id) {
                warn!(mutation = %id, error = %e, "optimistic replay failed");
            }
            self.mark_layer(id);
        }
    }

    // ── Reconciliation ───────────────────────────────────────────

    /// Opens a transaction writing to `target`.
    pub fn transaction(&mut self, target: TxnTarget) -> CacheTxn<'_> {
        CacheTxn::new(self, target)
    }

    /// Runs a reconciliation function against `target`.
    pub fn reconcile(
        &mut self,
        target: TxnTarget,
        reconcile: &ReconcileFn,
        data: &Value,
    ) -> StoreResult<()> {
        let mut txn = self.transaction(target);
        reconcile(&mut txn, data)
    }

    pub(crate) fn layer_write_entity(&mut self, id: MutationId, record: &EntityRecord) -> StoreResult<()> {
        let layer = self.optimistic.layer_mut(id).ok_or(StoreError::UnknownLayer(id))?;
        layer.write_entity(record);
        self.changes.entities.insert(record.key.clone());
        Ok(())
    }

    pub(crate) fn layer_evict_entity(&mut self, id: MutationId, key: &EntityKey) -> StoreResult<()> {
        let layer = self.optimistic.layer_mut(id).ok_or(StoreError::UnknownLayer(id))?;
        layer.evict_entity(key);
        self.changes.entities.insert(key.clone());
        Ok(())
    }

    pub(crate) fn layer_write_query(&mut self, id: MutationId, key: QueryKey, root: QueryRoot) -> StoreResult<()> {
        let layer = self.optimistic.layer_mut(id).ok_or(StoreError::UnknownLayer(id))?;
        layer.write_query(key.clone(), root);
        self.changes.queries.insert(key);
        Ok(())
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Ends a state transition: replays stale layers and returns everything
    /// touched since the previous flush.
    pub fn flush(&mut self) -> ChangeSet {
        if self.layers_stale && !self.optimistic.is_empty() {
            self.rebuild_layers();
        }
        self.layers_stale = false;
        let mut changes = std::mem::take(&mut self.changes);
        let dependents = self.queries.queries_touching(&changes.entities);
        changes.queries.extend(dependents);
        changes
    }

    /// Drops all data, layers and pending changes.
    pub fn clear(&mut self) {
        self.entities.clear();
        self.queries.clear();
        self.optimistic.clear();
        self.changes = ChangeSet::default();
        self.layers_stale = false;
    }
}

/// Read-only access to the cache at a fixed [`ReadBound`].
#[derive(Debug, Clone, Copy)]
pub struct CacheView<'a> {
    cache: &'a NormalizedCache,
    bound: ReadBound,
}

impl CacheView<'_> {
    pub fn bound(&self) -> ReadBound {
        self.bound
    }

    pub fn read_entity(&self, key: &EntityKey) -> Option<EntityRecord> {
        let base = self.cache.entities.read(key);
        match self.bound.layer_limit() {
            None => base.cloned(),
            Some(_) if self.cache.optimistic.is_empty() => base.cloned(),
            Some(upto) => self.cache.optimistic.apply_entity(key, base, upto),
        }
    }

    pub fn read_query_root(&self, key: &QueryKey) -> Option<QueryRoot> {
        let base = self.cache.queries.root(key);
        match self.bound.layer_limit() {
            None => base.cloned(),
            Some(upto) => self.cache.optimistic.apply_query(key, base, upto),
        }
    }

    /// Materializes `document` with `variables`.
    pub fn resolve(&self, document: &QueryDocument, variables: &Value) -> StoreResult<Materialized> {
        let (result, dependencies) = self.resolve_tracked(document, variables);
        result.map(|data| Materialized { data, dependencies })
    }

    /// Like [`resolve`](Self::resolve) but also reports dependencies on a miss.
    fn resolve_tracked(
        &self,
        document: &QueryDocument,
        variables: &Value,
    ) -> (StoreResult<Value>, BTreeSet<EntityKey>) {
        let key = QueryKey::new(&document.name, variables);
        let Some(root) = self.read_query_root(&key) else {
            return (
                Err(StoreError::CacheMiss {
                    path: key.to_string(),
                }),
                BTreeSet::new(),
            );
        };
        let mut materializer = Materializer::new(self, variables);
        let result = materializer.object(&root.fields, None, Some(&document.selection), &document.name);
        (result, materializer.into_dependencies())
    }

    pub fn resolve_fragment(&self, fragment: &Fragment, key: &EntityKey) -> StoreResult<Materialized> {
        let variables = Value::Null;
        let mut materializer = Materializer::new(self, &variables);
        let path = format!("...{}", fragment.name);
        let data = materializer.entity(key, Some(&fragment.selection), &path)?;
        Ok(Materialized {
            data,
            dependencies: materializer.into_dependencies(),
        })
    }
}

impl EntitySource for CacheView<'_> {
    fn entity(&self, key: &EntityKey) -> Option<EntityRecord> {
        self.read_entity(key)
    }
}
