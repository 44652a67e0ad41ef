use optistack_types::EntityKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Field carrying an object's typename in every response payload.
pub const TYPENAME_FIELD: &str = "__typename";

/// Identifier field assumed for types that were not registered.
pub const DEFAULT_ID_FIELD: &str = "id";

/// Describes how to derive the identity of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub entity_type: String,
    /// Field holding the server-assigned identifier.
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

fn default_id_field() -> String {
    DEFAULT_ID_FIELD.to_string()
}

impl EntitySchema {
    /// Schema for a type identified by its `id` field.
    pub fn new(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.into(),
            id_field: default_id_field(),
        }
    }

    /// Schema for a type identified by a custom field (e.g. `isbn`).
    pub fn with_id_field(entity_type: &str, id_field: &str) -> Self {
        Self {
            entity_type: entity_type.into(),
            id_field: id_field.into(),
        }
    }
}

/// Static lookup table from typename to identity rules, supplied once at
/// client construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaRegistry {
    types: HashMap<String, EntitySchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    #[must_use]
    pub fn with(mut self, schema: EntitySchema) -> Self {
        self.register(schema);
        self
    }

    pub fn register(&mut self, schema: EntitySchema) {
        self.types.insert(schema.entity_type.clone(), schema);
    }

    pub fn get(&self, entity_type: &str) -> Option<&EntitySchema> {
        self.types.get(entity_type)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Id field for `entity_type`, falling back to [`DEFAULT_ID_FIELD`].
    pub fn id_field(&self, entity_type: &str) -> &str {
        self.types
            .get(entity_type)
            .map(|s| s.id_field.as_str())
            .unwrap_or(DEFAULT_ID_FIELD)
    }

    /// Derives the entity key of a response object.
    ///
    /// Returns `None` for objects without a typename or without a usable id;
    /// those are stored embedded in their parent. String and numeric ids are
    /// accepted, numbers are rendered in decimal.
    pub fn identify(&self, object: &Map<String, Value>) -> Option<EntityKey> {
        let typename = object.get(TYPENAME_FIELD)?.as_str()?;
        let id = match object.get(self.id_field(typename))? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(EntityKey::new(typename, id))
    }

    /// Like [`identify`](Self::identify) for an arbitrary JSON value.
    pub fn identify_value(&self, value: &Value) -> Option<EntityKey> {
        value.as_object().and_then(|o| self.identify(o))
    }
}
