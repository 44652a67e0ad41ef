use optistack_types::EntityKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A single stored field value.
///
/// Nested entities are never stored inline: normalization replaces them with
/// a [`FieldValue::Ref`] so every result referencing the entity observes the
/// same canonical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Any JSON value that contains no entities.
    Scalar(Value),
    /// Reference to a normalized entity.
    Ref(EntityKey),
    /// Ordered list of values (typically references).
    List(Vec<FieldValue>),
    /// Embedded object without identity of its own.
    Object(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Shorthand for a scalar value.
    pub fn scalar(value: impl Into<Value>) -> Self {
        Self::Scalar(value.into())
    }

    /// Shorthand for a list of references.
    pub fn refs(keys: impl IntoIterator<Item = EntityKey>) -> Self {
        Self::List(keys.into_iter().map(Self::Ref).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Scalar(Value::Null))
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_entity_key(&self) -> Option<&EntityKey> {
        match self {
            Self::Ref(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut Vec<FieldValue>> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Collects every entity key reachable inside this value.
    pub fn references(&self) -> BTreeSet<EntityKey> {
        let mut keys = BTreeSet::new();
        self.collect_references(&mut keys);
        keys
    }

    fn collect_references(&self, keys: &mut BTreeSet<EntityKey>) {
        match self {
            Self::Scalar(_) => {}
            Self::Ref(key) => {
                keys.insert(key.clone());
            }
            Self::List(items) => items.iter().for_each(|v| v.collect_references(keys)),
            Self::Object(fields) => fields.values().for_each(|v| v.collect_references(keys)),
        }
    }
}

impl From<EntityKey> for FieldValue {
    fn from(key: EntityKey) -> Self {
        Self::Ref(key)
    }
}
