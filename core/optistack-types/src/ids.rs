//! Identifier types used throughout the optistack core.

use crate::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable identity of a normalized entity: its typename plus the
/// server-assigned identifier, rendered as `Typename:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey {
    typename: String,
    id: String,
}

impl EntityKey {
    /// Creates a key from a typename and an id.
    pub fn new(typename: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            typename: typename.into(),
            id: id.into(),
        }
    }

    /// Parses a key of the form `Typename:id`.
    ///
    /// The split happens at the first `:` so ids may themselves contain colons.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s.split_once(':') {
            Some((typename, id)) if !typename.is_empty() && !id.is_empty() => {
                Ok(Self::new(typename, id))
            }
            _ => Err(Error::InvalidEntityKey(s.to_string())),
        }
    }

    /// The entity's typename.
    pub fn typename(&self) -> &str {
        &self.typename
    }

    /// The server-assigned identifier.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.typename, self.id)
    }
}

impl FromStr for EntityKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EntityKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EntityKey> for String {
    fn from(key: EntityKey) -> Self {
        key.to_string()
    }
}

/// Identity of a materialized query result: the operation name plus its
/// variables in canonical JSON form.
///
/// `serde_json` objects are sorted maps, so two variable sets with the same
/// content always produce the same key regardless of construction order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    name: String,
    variables: String,
}

impl QueryKey {
    /// Creates a key for `name` with the given variables. `null` is treated
    /// the same as an empty object.
    pub fn new(name: impl Into<String>, variables: &Value) -> Self {
        let variables = match variables {
            Value::Null => "{}".to_string(),
            other => other.to_string(),
        };
        Self {
            name: name.into(),
            variables,
        }
    }

    /// Creates a key for an operation without variables.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, &Value::Null)
    }

    /// The operation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The canonical JSON text of the variables.
    pub fn variables_json(&self) -> &str {
        &self.variables
    }

    /// Parses the variables back into a JSON value.
    pub fn variables(&self) -> Result<Value, Error> {
        Ok(serde_json::from_str(&self.variables)?)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.variables)
    }
}

/// Monotonically increasing sequence number assigned to each mutation
/// invocation. Overlay layers are ordered by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(u64);

impl MutationId {
    /// The first id handed out by a fresh client.
    #[must_use]
    pub const fn first() -> Self {
        Self(1)
    }

    /// Wraps a raw sequence number.
    #[must_use]
    pub const fn from_value(value: u64) -> Self {
        Self(value)
    }

    /// The id following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The raw sequence number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m#{}", self.0)
    }
}

/// Handle identifying one observer registration on the notification bus.
/// Uses UUID v7 so handles sort by registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObserverId(Uuid);

impl ObserverId {
    /// Creates a new observer ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates an observer ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObserverId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}
