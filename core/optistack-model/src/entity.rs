use crate::FieldValue;
use optistack_types::EntityKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A normalized entity: the field data stored under one key.
///
/// The store holds at most one canonical record per key; writes merge into it
/// field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub key: EntityKey,
    pub fields: BTreeMap<String, FieldValue>,
}

impl EntityRecord {
    /// Creates an empty record for `key`.
    pub fn new(key: EntityKey) -> Self {
        Self {
            key,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Extract a string scalar.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.field(name)
            .and_then(FieldValue::as_scalar)
            .and_then(Value::as_str)
    }

    /// Extract a numeric scalar.
    pub fn get_number(&self, name: &str) -> Option<f64> {
        self.field(name)
            .and_then(FieldValue::as_scalar)
            .and_then(Value::as_f64)
    }

    /// Last-write-wins merge of `other`'s fields into this record.
    /// Returns the names of fields whose value actually changed.
    pub fn merge_from(&mut self, other: &EntityRecord) -> Vec<String> {
        self.merge_fields(other.fields.iter())
    }

    /// Same as [`merge_from`](Self::merge_from) over an arbitrary field iterator.
    pub fn merge_fields<'a>(
        &mut self,
        fields: impl IntoIterator<Item = (&'a String, &'a FieldValue)>,
    ) -> Vec<String> {
        let mut changed = Vec::new();
        for (name, value) in fields {
            if self.fields.get(name) != Some(value) {
                self.fields.insert(name.clone(), value.clone());
                changed.push(name.clone());
            }
        }
        changed
    }
}
