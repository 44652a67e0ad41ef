use optistack_model::{EntityRecord, FieldValue};
use optistack_types::EntityKey;
use std::collections::HashMap;

/// Outcome of a single canonical write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub key: EntityKey,
    /// The key had no canonical record before this write.
    pub created: bool,
    /// Fields whose stored value changed.
    pub changed_fields: Vec<String>,
}

impl WriteOutcome {
    /// True when the write left the record exactly as it was.
    pub fn is_noop(&self) -> bool {
        !self.created && self.changed_fields.is_empty()
    }
}

/// Canonical, server-confirmed entity records. At most one record per key.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    records: HashMap<EntityKey, EntityRecord>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts `record`, merging fields last-write-wins.
    pub fn write(&mut self, record: &EntityRecord) -> WriteOutcome {
        self.write_fields(&record.key, record.fields.iter())
    }

    /// Upserts the given fields into the record for `key`.
    pub fn write_fields<'a>(
        &mut self,
        key: &EntityKey,
        fields: impl IntoIterator<Item = (&'a String, &'a FieldValue)>,
    ) -> WriteOutcome {
        let created = !self.records.contains_key(key);
        let changed_fields = self
            .records
            .entry(key.clone())
            .or_insert_with(|| EntityRecord::new(key.clone()))
            .merge_fields(fields);
        WriteOutcome {
            key: key.clone(),
            created,
            changed_fields,
        }
    }

    /// The canonical record, or `None` when the key is unknown.
    pub fn read(&self, key: &EntityKey) -> Option<&EntityRecord> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<EntityRecord> {
        self.records.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
