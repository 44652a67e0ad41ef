use optistack_model::{EntityRecord, EntitySchema, FieldValue, QueryDocument, SchemaRegistry, Selection};
use optistack_store::{CacheTxn, NormalizedCache, ReconcileFn, StoreError, TxnTarget};
use optistack_types::{EntityKey, MutationId, QueryKey};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;

fn registry() -> SchemaRegistry {
    SchemaRegistry::new().with(EntitySchema::new("Pet"))
}

fn all_pets_key() -> QueryKey {
    QueryKey::named("AllPets")
}

fn all_pets_doc() -> QueryDocument {
    QueryDocument::new("AllPets", Selection::new().nested("pets", Selection::fields(["id", "name"])))
}

fn seeded() -> NormalizedCache {
    let mut cache = NormalizedCache::new(registry());
    cache
        .write_query_result(
            &all_pets_key(),
            &json!({"pets": [
                {"__typename": "Pet", "id": "1", "name": "Rex"},
                {"__typename": "Pet", "id": "2", "name": "Tom"}
            ]}),
        )
        .unwrap();
    cache.flush();
    cache
}

fn add_pet(id: &str, name: &str) -> Value {
    json!({"addPet": {"__typename": "Pet", "id": id, "name": name}})
}

fn rename(id: &str, name: &str) -> Value {
    json!({"renamePet": {"__typename": "Pet", "id": id, "name": name}})
}

/// Prepends the returned pet to the `AllPets` list.
fn prepend_pet() -> ReconcileFn {
    Arc::new(|txn: &mut CacheTxn<'_>, data: &Value| {
        let key = txn
            .identify(&data["addPet"])
            .ok_or_else(|| StoreError::Reconcile("addPet returned no pet".into()))?;
        txn.prepend_to_list(&all_pets_key(), "pets", FieldValue::Ref(key))
    })
}

fn pet_ids(cache: &mut NormalizedCache) -> Vec<String> {
    let data = cache.resolve(&all_pets_doc(), &json!({})).unwrap().data;
    data["pets"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap().to_string())
        .collect()
}

fn name_of(cache: &NormalizedCache, id: &str) -> Option<String> {
    cache
        .read_entity(&EntityKey::new("Pet", id))
        .and_then(|r| r.get_str("name").map(str::to_string))
}

/// Server-side commit of mutation `id` the way the executor drives it.
fn commit(cache: &mut NormalizedCache, id: MutationId, data: &Value, reconcile: Option<&ReconcileFn>) {
    cache.remove_optimistic(id);
    cache.commit_mutation(id, data).unwrap();
    if let Some(reconcile) = reconcile {
        cache.reconcile(TxnTarget::Canonical, reconcile, data).unwrap();
    }
    cache.settle_mutation(id);
}

fn reject(cache: &mut NormalizedCache, id: MutationId) {
    cache.remove_optimistic(id);
    cache.settle_mutation(id);
}

// ── Overlay reads ────────────────────────────────────────────────

#[test]
fn overlay_is_preferred_while_pending() {
    let mut cache = seeded();
    let m1 = MutationId::first();
    cache.begin_mutation(m1);
    cache.push_optimistic(m1, add_pet("temp", "Rex"), Some(prepend_pet())).unwrap();
    let changes = cache.flush();

    assert!(changes.touches_entity(&EntityKey::new("Pet", "temp")));
    assert!(changes.touches_query(&all_pets_key()));
    assert_eq!(pet_ids(&mut cache), vec!["temp", "1", "2"]);
    assert_eq!(cache.queries().root(&all_pets_key()).unwrap().list_len("pets"), Some(2));
    assert!(cache.read_canonical(&EntityKey::new("Pet", "temp")).is_none());
    assert_eq!(cache.optimistic_layer_count(), 1);
}

#[test]
fn optimistic_field_patch_reads_through() {
    let mut cache = seeded();
    let m1 = MutationId::first();
    cache.begin_mutation(m1);
    cache.push_optimistic(m1, rename("1", "Max"), None).unwrap();

    assert_eq!(name_of(&cache, "1").as_deref(), Some("Max"));
    assert_eq!(cache.read_canonical(&EntityKey::new("Pet", "1")).unwrap().get_str("name"), Some("Rex"));
}

#[test]
fn optimistic_eviction_hides_entity() {
    let mut cache = seeded();
    let m1 = MutationId::first();
    let key = EntityKey::new("Pet", "1");
    let evict: ReconcileFn = Arc::new(|txn: &mut CacheTxn<'_>, _: &Value| txn.evict(&EntityKey::new("Pet", "1")));
    cache.begin_mutation(m1);
    cache.push_optimistic(m1, json!({"removePet": true}), Some(evict)).unwrap();
    assert!(cache.read_entity(&key).is_none());

    reject(&mut cache, m1);
    cache.flush();
    assert_eq!(name_of(&cache, "1").as_deref(), Some("Rex"));
}

// ── Commit / reject ──────────────────────────────────────────────

#[test]
fn commit_replaces_temporary_entity() {
    let mut cache = seeded();
    let m1 = MutationId::first();
    let reconcile = prepend_pet();
    cache.begin_mutation(m1);
    cache.push_optimistic(m1, add_pet("temp", "Rex"), Some(reconcile.clone())).unwrap();
    cache.flush();

    commit(&mut cache, m1, &add_pet("42", "Rex"), Some(&reconcile));
    let changes = cache.flush();

    assert!(changes.touches_entity(&EntityKey::new("Pet", "temp")));
    assert!(changes.touches_entity(&EntityKey::new("Pet", "42")));
    assert_eq!(pet_ids(&mut cache), vec!["42", "1", "2"]);
    assert!(cache.read_entity(&EntityKey::new("Pet", "temp")).is_none());
    assert_eq!(cache.optimistic_layer_count(), 0);
    assert_eq!(cache.in_flight_count(), 0);
}

#[test]
fn rejection_restores_previous_result_exactly() {
    let mut cache = seeded();
    let before = cache.resolve(&all_pets_doc(), &json!({})).unwrap().data;

    let m1 = MutationId::first();
    cache.begin_mutation(m1);
    cache.push_optimistic(m1, add_pet("temp", "Rex"), Some(prepend_pet())).unwrap();
    cache.flush();
    reject(&mut cache, m1);
    let changes = cache.flush();

    assert!(changes.touches_query(&all_pets_key()));
    assert_eq!(cache.resolve(&all_pets_doc(), &json!({})).unwrap().data, before);
    assert!(cache.read_entity(&EntityKey::new("Pet", "temp")).is_none());
    assert_eq!(cache.optimistic_layer_count(), 0);
}

#[test]
fn invalid_optimistic_payload_creates_no_layer() {
    let mut cache = seeded();
    let m1 = MutationId::first();
    cache.begin_mutation(m1);
    let err = cache
        .push_optimistic(m1, json!({"addPet": {"__typename": "Pet", "name": "Rex"}}), None)
        .unwrap_err();

    assert!(matches!(err, StoreError::InvalidPayload(_)));
    assert_eq!(cache.optimistic_layer_count(), 0);
    assert!(cache.flush().is_empty());
}

#[test]
fn failing_reconcile_keeps_layer_entities() {
    let mut cache = seeded();
    let m1 = MutationId::first();
    let failing: ReconcileFn = Arc::new(|_: &mut CacheTxn<'_>, _: &Value| Err(StoreError::Reconcile("boom".into())));
    cache.begin_mutation(m1);
    let err = cache.push_optimistic(m1, add_pet("temp", "Rex"), Some(failing)).unwrap_err();

    assert!(matches!(err, StoreError::Reconcile(_)));
    assert_eq!(cache.optimistic_layer_count(), 1);
    assert_eq!(name_of(&cache, "temp").as_deref(), Some("Rex"));
    assert_eq!(pet_ids(&mut cache), vec!["1", "2"]);
}

// ── Concurrent mutations ─────────────────────────────────────────

#[test]
fn later_layer_wins_while_both_pending() {
    let mut cache = seeded();
    let m1 = MutationId::first();
    let m2 = m1.next();
    for (id, name) in [(m1, "A"), (m2, "B")] {
        cache.begin_mutation(id);
        cache.push_optimistic(id, rename("1", name), None).unwrap();
    }
    assert_eq!(name_of(&cache, "1").as_deref(), Some("B"));

    reject(&mut cache, m2);
    cache.flush();
    assert_eq!(name_of(&cache, "1").as_deref(), Some("A"));
}

#[test]
fn earlier_layer_cannot_hide_later_commit() {
    let mut cache = seeded();
    let m1 = MutationId::first();
    let m2 = m1.next();
    for (id, name) in [(m1, "A"), (m2, "B")] {
        cache.begin_mutation(id);
        cache.push_optimistic(id, rename("1", name), None).unwrap();
    }

    commit(&mut cache, m2, &rename("1", "B2"), None);
    cache.flush();
    assert_eq!(name_of(&cache, "1").as_deref(), Some("B2"));

    reject(&mut cache, m1);
    cache.flush();
    assert_eq!(name_of(&cache, "1").as_deref(), Some("B2"));
}

#[test]
fn earlier_commit_does_not_overwrite_later_commit() {
    let mut cache = seeded();
    let m1 = MutationId::first();
    let m2 = m1.next();
    for (id, name) in [(m1, "A"), (m2, "B")] {
        cache.begin_mutation(id);
        cache.push_optimistic(id, rename("1", name), None).unwrap();
    }

    commit(&mut cache, m2, &rename("1", "B2"), None);
    commit(&mut cache, m1, &rename("1", "A1"), None);
    cache.flush();

    assert_eq!(name_of(&cache, "1").as_deref(), Some("B2"));
    assert_eq!(cache.optimistic().watermark(&EntityKey::new("Pet", "1"), "name"), None);
}

#[test]
fn commits_in_order_apply_last_value() {
    let mut cache = seeded();
    let m1 = MutationId::first();
    let m2 = m1.next();
    for (id, name) in [(m1, "A"), (m2, "B")] {
        cache.begin_mutation(id);
        cache.push_optimistic(id, rename("1", name), None).unwrap();
    }

    commit(&mut cache, m1, &rename("1", "A1"), None);
    cache.flush();
    assert_eq!(name_of(&cache, "1").as_deref(), Some("B"));

    commit(&mut cache, m2, &rename("1", "B2"), None);
    cache.flush();
    assert_eq!(name_of(&cache, "1").as_deref(), Some("B2"));
}

#[test]
fn pending_layer_is_replayed_over_new_canonical_data() {
    let mut cache = seeded();
    let reconcile = prepend_pet();
    let m1 = MutationId::first();
    let m2 = m1.next();
    cache.begin_mutation(m1);
    cache.push_optimistic(m1, add_pet("temp-1", "Rex"), Some(reconcile.clone())).unwrap();
    cache.begin_mutation(m2);
    cache.push_optimistic(m2, add_pet("temp-2", "Fido"), Some(reconcile.clone())).unwrap();
    cache.flush();
    assert_eq!(pet_ids(&mut cache), vec!["temp-2", "temp-1", "1", "2"]);

    commit(&mut cache, m2, &add_pet("43", "Fido"), Some(&reconcile));
    let changes = cache.flush();

    assert!(changes.touches_query(&all_pets_key()));
    assert_eq!(pet_ids(&mut cache), vec!["temp-1", "43", "1", "2"]);
    assert_eq!(cache.queries().root(&all_pets_key()).unwrap().list_len("pets"), Some(3));

    commit(&mut cache, m1, &add_pet("42", "Rex"), Some(&reconcile));
    cache.flush();
    assert_eq!(pet_ids(&mut cache), vec!["42", "43", "1", "2"]);
}

#[test]
fn watermarks_survive_until_lower_mutations_settle() {
    let mut cache = seeded();
    let m1 = MutationId::first();
    let m2 = m1.next();
    let key = EntityKey::new("Pet", "1");
    cache.begin_mutation(m1);
    cache.begin_mutation(m2);
    commit(&mut cache, m2, &rename("1", "B2"), None);

    assert_eq!(cache.optimistic().watermark(&key, "name"), Some(m2));
    reject(&mut cache, m1);
    assert_eq!(cache.optimistic().watermark(&key, "name"), None);
}

#[test]
fn non_optimistic_commit_writes_canonically() {
    let mut cache = seeded();
    // Registers AllPets' dependencies.
    pet_ids(&mut cache);
    let m1 = MutationId::first();
    cache.begin_mutation(m1);
    commit(&mut cache, m1, &rename("2", "Tommy"), None);
    let changes = cache.flush();

    assert_eq!(name_of(&cache, "2").as_deref(), Some("Tommy"));
    assert!(changes.touches_query(&all_pets_key()));
}

#[test]
fn canonical_transaction_edits_lists() {
    let mut cache = seeded();
    let removed = cache
        .transaction(TxnTarget::Canonical)
        .remove_from_list(&all_pets_key(), "pets", &EntityKey::new("Pet", "1"))
        .unwrap();
    cache.flush();

    assert!(removed);
    assert_eq!(pet_ids(&mut cache), vec!["2"]);
}

#[test]
fn clear_drops_everything() {
    let mut cache = seeded();
    let m1 = MutationId::first();
    cache.begin_mutation(m1);
    cache.push_optimistic(m1, rename("1", "Max"), None).unwrap();
    cache.write_entity(&EntityRecord::new(EntityKey::new("Pet", "3")));
    cache.clear();

    assert!(cache.entities().is_empty());
    assert_eq!(cache.optimistic_layer_count(), 0);
    assert_eq!(cache.in_flight_count(), 0);
    assert!(cache.flush().is_empty());
}
