//! Materialization: walking stored references into a JSON result.

use crate::error::{StoreError, StoreResult};
use optistack_model::{FieldValue, Selected, Selection, TYPENAME_FIELD};
use optistack_types::EntityKey;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Anything entity records can be read from.
pub trait EntitySource {
    fn entity(&self, key: &EntityKey) -> Option<optistack_model::EntityRecord>;
}

/// A fully materialized result and the entities it was composed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Materialized {
    pub data: Value,
    pub dependencies: BTreeSet<EntityKey>,
}

pub(crate) struct Materializer<'a, S: EntitySource + ?Sized> {
    source: &'a S,
    variables: &'a Value,
    dependencies: BTreeSet<EntityKey>,
    // Entities currently being expanded without a selection; breaks cycles.
    stack: Vec<EntityKey>,
}

impl<'a, S: EntitySource + ?Sized> Materializer<'a, S> {
    pub(crate) fn new(source: &'a S, variables: &'a Value) -> Self {
        Self {
            source,
            variables,
            dependencies: BTreeSet::new(),
            stack: Vec::new(),
        }
    }

    pub(crate) fn into_dependencies(self) -> BTreeSet<EntityKey> {
        self.dependencies
    }

    /// Materializes a field map (query root, entity or embedded object).
    pub(crate) fn object(
        &mut self,
        fields: &BTreeMap<String, FieldValue>,
        typename: Option<&str>,
        selection: Option<&Selection>,
        path: &str,
    ) -> StoreResult<Value> {
        let mut out = Map::new();
        let Some(selection) = selection else {
            for (name, value) in fields {
                let v = self.value(value, None, &format!("{path}.{name}"))?;
                out.insert(name.clone(), v);
            }
            return Ok(Value::Object(out));
        };

        for item in &selection.items {
            match item {
                Selected::Field(field) => {
                    if !field.is_active(self.variables) {
                        continue;
                    }
                    let child_path = format!("{path}.{}", field.name);
                    let value = match (fields.get(&field.name), typename) {
                        (Some(stored), _) => {
                            self.value(stored, field.selection.as_ref(), &child_path)?
                        }
                        (None, Some(t)) if field.name == TYPENAME_FIELD => Value::String(t.into()),
                        (None, _) => return Err(StoreError::CacheMiss { path: child_path }),
                    };
                    merge_into(&mut out, field.response_key(), value);
                }
                Selected::Fragment(fragment) => {
                    if !fragment.applies_to(typename) {
                        continue;
                    }
                    if let Value::Object(spread) =
                        self.object(fields, typename, Some(&fragment.selection), path)?
                    {
                        for (k, v) in spread {
                            merge_into(&mut out, &k, v);
                        }
                    }
                }
            }
        }
        Ok(Value::Object(out))
    }

    fn value(
        &mut self,
        value: &FieldValue,
        selection: Option<&Selection>,
        path: &str,
    ) -> StoreResult<Value> {
        match value {
            FieldValue::Scalar(v) => Ok(v.clone()),
            FieldValue::Ref(key) => self.entity(key, selection, path),
            FieldValue::List(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| self.value(item, selection, &format!("{path}[{i}]")))
                .collect::<StoreResult<Vec<_>>>()
                .map(Value::Array),
            FieldValue::Object(fields) => {
                let typename = fields
                    .get(TYPENAME_FIELD)
                    .and_then(FieldValue::as_scalar)
                    .and_then(Value::as_str);
                self.object(fields, typename, selection, path)
            }
        }
    }

    pub(crate) fn entity(
        &mut self,
        key: &EntityKey,
        selection: Option<&Selection>,
        path: &str,
    ) -> StoreResult<Value> {
        self.dependencies.insert(key.clone());
        if selection.is_none() && self.stack.contains(key) {
            return Ok(serde_json::json!({ "__ref": key.to_string() }));
        }
        let record = self.source.entity(key).ok_or_else(|| StoreError::CacheMiss {
            path: format!("{path} ({key})"),
        })?;
        self.stack.push(key.clone());
        let result = self.object(&record.fields, Some(key.typename()), selection, path);
        self.stack.pop();
        result
    }
}

/// Inserts `value` under `key`, deep-merging objects selected more than
/// once (e.g. by a field and a fragment).
fn merge_into(target: &mut Map<String, Value>, key: &str, value: Value) {
    if let Some(existing) = target.get_mut(key) {
        merge_value(existing, value);
    } else {
        target.insert(key.to_string(), value);
    }
}

fn merge_value(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(current), Value::Object(extra)) => {
            for (k, v) in extra {
                merge_into(current, &k, v);
            }
        }
        (Value::Array(current), Value::Array(extra)) if current.len() == extra.len() => {
            for (slot, v) in current.iter_mut().zip(extra) {
                merge_value(slot, v);
            }
        }
        (slot, v) => *slot = v,
    }
}
