//! Payload normalization.
//!
//! Splits a response (or optimistic) payload into flat entity records and a
//! root value in which every identifiable object is replaced by a reference.

use crate::error::{StoreError, StoreResult};
use crate::query_cache::QueryRoot;
use optistack_model::{EntityRecord, FieldValue, SchemaRegistry, TYPENAME_FIELD};
use optistack_types::EntityKey;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Result of normalizing one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub root: FieldValue,
    /// One record per entity; nested entities precede their parents. An
    /// entity appearing more than once in the payload is merged into a
    /// single record.
    pub records: Vec<EntityRecord>,
}

/// Normalizes an arbitrary payload.
///
/// Fails when an object names a registered type but lacks a usable id,
/// since storing it embedded would silently fork that entity's data.
pub fn normalize(registry: &SchemaRegistry, value: &Value) -> StoreResult<Normalized> {
    let mut normalizer = Normalizer {
        registry,
        records: Vec::new(),
        index: HashMap::new(),
    };
    let root = normalizer.value(value, "$")?;
    Ok(Normalized {
        root,
        records: normalizer.records,
    })
}

/// Normalizes a payload whose top level must be an object, as operation
/// data always is.
pub fn normalize_root(
    registry: &SchemaRegistry,
    value: &Value,
) -> StoreResult<(QueryRoot, Vec<EntityRecord>)> {
    if !value.is_object() {
        return Err(StoreError::InvalidPayload(format!(
            "operation data must be an object, got {value}"
        )));
    }
    let Normalized { root, records } = normalize(registry, value)?;
    let fields = match root {
        FieldValue::Object(fields) => fields,
        // A top-level object with identity is stored by reference only.
        FieldValue::Ref(_) => BTreeMap::new(),
        other => {
            return Err(StoreError::InvalidPayload(format!(
                "unexpected root value {other:?}"
            )));
        }
    };
    Ok((QueryRoot { fields }, records))
}

struct Normalizer<'a> {
    registry: &'a SchemaRegistry,
    records: Vec<EntityRecord>,
    index: HashMap<EntityKey, usize>,
}

impl Normalizer<'_> {
    fn value(&mut self, value: &Value, path: &str) -> StoreResult<FieldValue> {
        match value {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| self.value(item, &format!("{path}[{i}]")))
                .collect::<StoreResult<Vec<_>>>()
                .map(FieldValue::List),
            Value::Object(object) => self.object(object, path),
            scalar => Ok(FieldValue::Scalar(scalar.clone())),
        }
    }

    fn object(&mut self, object: &Map<String, Value>, path: &str) -> StoreResult<FieldValue> {
        let fields = object
            .iter()
            .map(|(name, v)| Ok((name.clone(), self.value(v, &format!("{path}.{name}"))?)))
            .collect::<StoreResult<BTreeMap<_, _>>>()?;

        let Some(key) = self.registry.identify(object) else {
            if let Some(typename) = object.get(TYPENAME_FIELD).and_then(Value::as_str) {
                if self.registry.get(typename).is_some() {
                    return Err(StoreError::InvalidPayload(format!(
                        "{typename} object at {path} has no usable `{}`",
                        self.registry.id_field(typename)
                    )));
                }
            }
            return Ok(FieldValue::Object(fields));
        };

        match self.index.get(&key) {
            Some(&i) => {
                self.records[i].merge_fields(fields.iter());
            }
            None => {
                self.index.insert(key.clone(), self.records.len());
                self.records.push(EntityRecord {
                    key: key.clone(),
                    fields,
                });
            }
        }
        Ok(FieldValue::Ref(key))
    }
}
