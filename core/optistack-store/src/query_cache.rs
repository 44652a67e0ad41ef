//! Query result roots and the query → entity dependency index.
//!
//! List-valued root fields are never changed implicitly: a canonical entity
//! write cannot tell whether a new entity belongs in a list, so insertion and
//! removal go through the explicit [`QueryRoot`] list helpers, usually from a
//! reconciliation function.

use crate::error::{StoreError, StoreResult};
use optistack_model::FieldValue;
use optistack_types::{EntityKey, QueryKey};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Root fields of one query result. Entities appear as references.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRoot {
    pub fields: BTreeMap<String, FieldValue>,
}

impl QueryRoot {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Length of a list field, `None` if absent or not a list.
    pub fn list_len(&self, name: &str) -> Option<usize> {
        self.field(name).and_then(FieldValue::as_list).map(<[_]>::len)
    }

    /// Inserts `value` at the front of list field `name`, creating the list
    /// if the field is absent.
    pub fn prepend_to_list(&mut self, name: &str, value: FieldValue) -> StoreResult<()> {
        self.list_mut(name)?.insert(0, value);
        Ok(())
    }

    /// Appends `value` to list field `name`, creating the list if absent.
    pub fn append_to_list(&mut self, name: &str, value: FieldValue) -> StoreResult<()> {
        self.list_mut(name)?.push(value);
        Ok(())
    }

    /// Removes every reference to `key` from list field `name`.
    /// Returns whether anything was removed.
    pub fn remove_from_list(&mut self, name: &str, key: &EntityKey) -> StoreResult<bool> {
        let list = self.list_mut(name)?;
        let before = list.len();
        list.retain(|item| item.as_entity_key() != Some(key));
        Ok(list.len() != before)
    }

    fn list_mut(&mut self, name: &str) -> StoreResult<&mut Vec<FieldValue>> {
        self.fields
            .entry(name.to_string())
            .or_insert_with(|| FieldValue::List(Vec::new()))
            .as_list_mut()
            .ok_or_else(|| StoreError::InvalidPayload(format!("field `{name}` is not a list")))
    }

    /// Every entity key referenced from the root.
    pub fn references(&self) -> BTreeSet<EntityKey> {
        self.fields.values().flat_map(FieldValue::references).collect()
    }
}

/// Canonical query roots plus the dependency index used to find the queries
/// affected by an entity write.
#[derive(Debug, Clone, Default)]
pub struct QueryCache {
    roots: HashMap<QueryKey, QueryRoot>,
    dependencies: HashMap<QueryKey, BTreeSet<EntityKey>>,
    dependents: HashMap<EntityKey, BTreeSet<QueryKey>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self, key: &QueryKey) -> Option<&QueryRoot> {
        self.roots.get(key)
    }

    /// Replaces the root of `key`. Returns whether it changed.
    pub fn write_root(&mut self, key: QueryKey, root: QueryRoot) -> bool {
        match self.roots.get(&key) {
            Some(existing) if *existing == root => false,
            _ => {
                self.roots.insert(key, root);
                true
            }
        }
    }

    /// Merges root fields into `key`, last-write-wins per field.
    /// Returns whether anything changed.
    pub fn merge_root(&mut self, key: QueryKey, fields: BTreeMap<String, FieldValue>) -> bool {
        let root = self.roots.entry(key).or_default();
        let mut changed = false;
        for (name, value) in fields {
            if root.fields.get(&name) != Some(&value) {
                root.fields.insert(name, value);
                changed = true;
            }
        }
        changed
    }

    /// Drops the root and dependency links of `key`.
    pub fn evict(&mut self, key: &QueryKey) -> Option<QueryRoot> {
        self.set_dependencies(key, BTreeSet::new());
        self.roots.remove(key)
    }

    /// Records that `query`'s materialized result depends on `entity`.
    pub fn register_dependency(&mut self, query: &QueryKey, entity: &EntityKey) {
        self.dependencies
            .entry(query.clone())
            .or_default()
            .insert(entity.clone());
        self.dependents
            .entry(entity.clone())
            .or_default()
            .insert(query.clone());
    }

    /// Replaces the full dependency set of `query`.
    pub fn set_dependencies(&mut self, query: &QueryKey, entities: BTreeSet<EntityKey>) {
        if let Some(old) = self.dependencies.remove(query) {
            for entity in old.difference(&entities) {
                if let Some(queries) = self.dependents.get_mut(entity) {
                    queries.remove(query);
                    if queries.is_empty() {
                        self.dependents.remove(entity);
                    }
                }
            }
        }
        for entity in &entities {
            self.dependents
                .entry(entity.clone())
                .or_default()
                .insert(query.clone());
        }
        if !entities.is_empty() {
            self.dependencies.insert(query.clone(), entities);
        }
    }

    pub fn dependencies_of(&self, query: &QueryKey) -> Option<&BTreeSet<EntityKey>> {
        self.dependencies.get(query)
    }

    pub fn dependents_of(&self, entity: &EntityKey) -> impl Iterator<Item = &QueryKey> {
        self.dependents.get(entity).into_iter().flatten()
    }

    /// Queries depending on any of `entities`.
    pub fn queries_touching<'a>(
        &self,
        entities: impl IntoIterator<Item = &'a EntityKey>,
    ) -> BTreeSet<QueryKey> {
        entities
            .into_iter()
            .flat_map(|e| self.dependents_of(e))
            .cloned()
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.roots.keys()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn clear(&mut self) {
        self.roots.clear();
        self.dependencies.clear();
        self.dependents.clear();
    }
}
