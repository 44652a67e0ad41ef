//! Optimistic overlay: provisional data of pending mutations.
//!
//! Each pending mutation with an optimistic payload owns one
//! [`OverlayLayer`], keyed by its [`MutationId`]. Layers are applied in
//! ascending id order over the canonical data and are never merged into the
//! canonical store. A layer remembers its [`OptimisticRecipe`] so it can be
//! rebuilt on top of changed canonical data.
//!
//! Field watermarks record the highest committed mutation that wrote each
//! `(entity, field)`. A layer with a lower id never shadows such a field,
//! so an older pending guess cannot hide a newer server value.

use crate::error::StoreResult;
use crate::query_cache::QueryRoot;
use crate::txn::CacheTxn;
use optistack_model::{EntityRecord, FieldValue};
use optistack_types::{EntityKey, MutationId, QueryKey};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Caller-supplied reconciliation: adjusts derived collections (lists) that
/// a single entity write cannot express. Receives the mutation's data.
pub type ReconcileFn = Arc<dyn Fn(&mut CacheTxn<'_>, &Value) -> StoreResult<()> + Send + Sync>;

/// Everything needed to (re)build a layer.
#[derive(Clone)]
pub struct OptimisticRecipe {
    /// The optimistic payload as the caller supplied it.
    pub data: Value,
    /// Entities normalized out of `data`.
    pub records: Vec<EntityRecord>,
    pub reconcile: Option<ReconcileFn>,
}

impl fmt::Debug for OptimisticRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticRecipe")
            .field("data", &self.data)
            .field("records", &self.records)
            .field("reconcile", &self.reconcile.is_some())
            .finish()
    }
}

/// Provisional state of one entity inside a layer.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayEntry {
    /// Fields patched over the record below.
    Fields(BTreeMap<String, FieldValue>),
    /// The entity reads as absent while the layer exists.
    Evicted,
}

/// One pending mutation's provisional writes.
#[derive(Debug, Clone)]
pub struct OverlayLayer {
    pub id: MutationId,
    pub entities: BTreeMap<EntityKey, OverlayEntry>,
    /// Whole query roots; the highest layer holding a root wins.
    pub queries: BTreeMap<QueryKey, QueryRoot>,
    pub recipe: OptimisticRecipe,
}

impl OverlayLayer {
    pub fn new(id: MutationId, recipe: OptimisticRecipe) -> Self {
        Self {
            id,
            entities: BTreeMap::new(),
            queries: BTreeMap::new(),
            recipe,
        }
    }

    /// Forgets all provisional writes, keeping the recipe.
    pub fn reset(&mut self) {
        self.entities.clear();
        self.queries.clear();
    }

    pub fn write_entity(&mut self, record: &EntityRecord) {
        match self.entities.get_mut(&record.key) {
            Some(OverlayEntry::Fields(fields)) => {
                fields.extend(record.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            _ => {
                self.entities
                    .insert(record.key.clone(), OverlayEntry::Fields(record.fields.clone()));
            }
        }
    }

    pub fn evict_entity(&mut self, key: &EntityKey) {
        self.entities.insert(key.clone(), OverlayEntry::Evicted);
    }

    pub fn write_query(&mut self, key: QueryKey, root: QueryRoot) {
        self.queries.insert(key, root);
    }

    pub fn touched_entities(&self) -> impl Iterator<Item = &EntityKey> {
        self.entities.keys()
    }

    pub fn touched_queries(&self) -> impl Iterator<Item = &QueryKey> {
        self.queries.keys()
    }
}

/// All overlay layers plus in-flight bookkeeping.
#[derive(Debug, Default)]
pub struct OptimisticLayer {
    layers: BTreeMap<MutationId, OverlayLayer>,
    in_flight: BTreeSet<MutationId>,
    watermarks: HashMap<EntityKey, HashMap<String, MutationId>>,
}

impl OptimisticLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a mutation as dispatched, with or without a layer.
    pub fn begin(&mut self, id: MutationId) {
        self.in_flight.insert(id);
    }

    /// Marks a mutation as resolved and drops watermarks no pending
    /// mutation can be shadowed by anymore.
    pub fn settle(&mut self, id: MutationId) {
        self.in_flight.remove(&id);
        self.prune_watermarks();
    }

    pub fn is_in_flight(&self, id: MutationId) -> bool {
        self.in_flight.contains(&id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn insert(&mut self, layer: OverlayLayer) {
        self.layers.insert(layer.id, layer);
    }

    pub fn remove(&mut self, id: MutationId) -> Option<OverlayLayer> {
        self.layers.remove(&id)
    }

    pub fn layer(&self, id: MutationId) -> Option<&OverlayLayer> {
        self.layers.get(&id)
    }

    pub fn layer_mut(&mut self, id: MutationId) -> Option<&mut OverlayLayer> {
        self.layers.get_mut(&id)
    }

    /// Layer ids in application order.
    pub fn ids(&self) -> Vec<MutationId> {
        self.layers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Records that mutation `id` committed `fields` of `key` canonically.
    pub fn record_commit<'a>(
        &mut self,
        id: MutationId,
        key: &EntityKey,
        fields: impl IntoIterator<Item = &'a String>,
    ) {
        let marks = self.watermarks.entry(key.clone()).or_default();
        for field in fields {
            let mark = marks.entry(field.clone()).or_insert(id);
            if *mark < id {
                *mark = id;
            }
        }
    }

    pub fn watermark(&self, key: &EntityKey, field: &str) -> Option<MutationId> {
        self.watermarks.get(key).and_then(|m| m.get(field)).copied()
    }

    /// Whether a write by mutation `id` to `key.field` is superseded by a
    /// later commit.
    pub fn is_shadowed(&self, id: MutationId, key: &EntityKey, field: &str) -> bool {
        self.watermark(key, field).is_some_and(|mark| mark > id)
    }

    fn prune_watermarks(&mut self) {
        match self.in_flight.first().copied() {
            None => self.watermarks.clear(),
            Some(floor) => {
                self.watermarks.retain(|_, marks| {
                    marks.retain(|_, mark| *mark > floor);
                    !marks.is_empty()
                });
            }
        }
    }

    /// Applies layers up to and including `upto` (all layers when `None`)
    /// over the canonical `base` record.
    pub fn apply_entity(
        &self,
        key: &EntityKey,
        base: Option<&EntityRecord>,
        upto: Option<MutationId>,
    ) -> Option<EntityRecord> {
        let mut current = base.cloned();
        for layer in self.layers_upto(upto) {
            match layer.entities.get(key) {
                Some(OverlayEntry::Fields(fields)) => {
                    let record = current.get_or_insert_with(|| EntityRecord::new(key.clone()));
                    record.merge_fields(
                        fields
                            .iter()
                            .filter(|(name, _)| !self.is_shadowed(layer.id, key, name)),
                    );
                }
                Some(OverlayEntry::Evicted) => current = None,
                None => {}
            }
        }
        current
    }

    /// The query root visible through layers up to `upto`.
    pub fn apply_query(
        &self,
        key: &QueryKey,
        base: Option<&QueryRoot>,
        upto: Option<MutationId>,
    ) -> Option<QueryRoot> {
        self.layers_upto(upto)
            .filter_map(|layer| layer.queries.get(key))
            .last()
            .or(base)
            .cloned()
    }

    fn layers_upto(&self, upto: Option<MutationId>) -> impl Iterator<Item = &OverlayLayer> {
        self.layers
            .values()
            .take_while(move |layer| upto.is_none_or(|limit| layer.id <= limit))
    }

    pub fn clear(&mut self) {
        self.layers.clear();
        self.in_flight.clear();
        self.watermarks.clear();
    }
}
