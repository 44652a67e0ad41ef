//! Read/write handle given to reconciliation functions.

use crate::cache::{NormalizedCache, ReadBound};
use crate::error::StoreResult;
use crate::query_cache::QueryRoot;
use optistack_model::{EntityRecord, FieldValue, QueryDocument};
use optistack_types::{EntityKey, MutationId, QueryKey};
use serde_json::Value;

/// Where a transaction's writes land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnTarget {
    /// The canonical store; reads see canonical data only.
    Canonical,
    /// One overlay layer; reads see canonical data plus layers up to and
    /// including this one.
    Optimistic(MutationId),
}

/// Scoped access to the cache for one reconciliation run.
pub struct CacheTxn<'a> {
    cache: &'a mut NormalizedCache,
    target: TxnTarget,
}

impl<'a> CacheTxn<'a> {
    pub(crate) fn new(cache: &'a mut NormalizedCache, target: TxnTarget) -> Self {
        Self { cache, target }
    }

    pub fn target(&self) -> TxnTarget {
        self.target
    }

    /// Whether writes go to an overlay layer rather than the canonical store.
    pub fn is_optimistic(&self) -> bool {
        matches!(self.target, TxnTarget::Optimistic(_))
    }

    fn bound(&self) -> ReadBound {
        match self.target {
            TxnTarget::Canonical => ReadBound::Canonical,
            TxnTarget::Optimistic(id) => ReadBound::Upto(id),
        }
    }

    /// Derives the entity key of a response object, e.g. the mutation's
    /// returned entity.
    pub fn identify(&self, value: &Value) -> Option<EntityKey> {
        self.cache.identify(value)
    }

    // ── Entities ─────────────────────────────────────────────────

    pub fn read_entity(&self, key: &EntityKey) -> Option<EntityRecord> {
        self.cache.view(self.bound()).read_entity(key)
    }

    pub fn write_entity(&mut self, record: &EntityRecord) -> StoreResult<()> {
        match self.target {
            TxnTarget::Canonical => {
                self.cache.write_entity(record);
                Ok(())
            }
            TxnTarget::Optimistic(id) => self.cache.layer_write_entity(id, record),
        }
    }

    pub fn evict(&mut self, key: &EntityKey) -> StoreResult<()> {
        match self.target {
            TxnTarget::Canonical => {
                self.cache.evict_entity(key);
                Ok(())
            }
            TxnTarget::Optimistic(id) => self.cache.layer_evict_entity(id, key),
        }
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn read_query(&self, key: &QueryKey) -> Option<QueryRoot> {
        self.cache.view(self.bound()).read_query_root(key)
    }

    pub fn write_query(&mut self, key: QueryKey, root: QueryRoot) -> StoreResult<()> {
        match self.target {
            TxnTarget::Canonical => {
                self.cache.write_query_root(key, root);
                Ok(())
            }
            TxnTarget::Optimistic(id) => self.cache.layer_write_query(id, key, root),
        }
    }

    /// Materializes a query as seen from this transaction.
    pub fn read_query_data(&self, document: &QueryDocument, variables: &Value) -> StoreResult<Value> {
        Ok(self.cache.view(self.bound()).resolve(document, variables)?.data)
    }

    /// Reads the root of `key` (empty if not cached), lets `f` edit it and
    /// writes it back.
    pub fn update_query<T>(
        &mut self,
        key: &QueryKey,
        f: impl FnOnce(&mut QueryRoot) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut root = self.read_query(key).unwrap_or_default();
        let out = f(&mut root)?;
        self.write_query(key.clone(), root)?;
        Ok(out)
    }

    pub fn prepend_to_list(&mut self, key: &QueryKey, field: &str, value: FieldValue) -> StoreResult<()> {
        self.update_query(key, |root| root.prepend_to_list(field, value))
    }

    pub fn append_to_list(&mut self, key: &QueryKey, field: &str, value: FieldValue) -> StoreResult<()> {
        self.update_query(key, |root| root.append_to_list(field, value))
    }

    pub fn remove_from_list(&mut self, key: &QueryKey, field: &str, entity: &EntityKey) -> StoreResult<bool> {
        self.update_query(key, |root| root.remove_from_list(field, entity))
    }
}
