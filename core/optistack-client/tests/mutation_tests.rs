use optistack_client::transport::mock::MockTransport;
use optistack_client::{
    Client, ClientConfig, ClientError, Mutation, MutationRequest, MutationStatus, QueryState, Subscription,
};
use optistack_model::{EntitySchema, QueryDocument, SchemaRegistry, Selection};
use optistack_store::{CacheTxn, StoreError};
use optistack_types::{EntityKey, QueryKey};
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

// ── Pet domain ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Pet {
    #[serde(rename = "__typename")]
    typename: String,
    id: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

impl Pet {
    fn new(id: &str, name: &str, kind: &str) -> Self {
        Self {
            typename: "Pet".into(),
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AddPetData {
    #[serde(rename = "addPet")]
    add_pet: Pet,
}

#[derive(Debug, Serialize)]
struct AddPetVars {
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

struct AddPet;

impl Mutation for AddPet {
    const NAME: &'static str = "AddPet";
    type Variables = AddPetVars;
    type Output = AddPetData;

    fn validate(variables: &AddPetVars) -> Result<(), String> {
        if variables.name.trim().is_empty() {
            return Err("pet name must not be empty".into());
        }
        Ok(())
    }
}

/// Untyped rename, for tests that need arbitrary payloads.
struct RenamePet;

impl Mutation for RenamePet {
    const NAME: &'static str = "RenamePet";
    type Variables = Value;
    type Output = Value;
}

fn all_pets_key() -> QueryKey {
    QueryKey::named("AllPets")
}

fn all_pets_doc() -> QueryDocument {
    QueryDocument::new(
        "AllPets",
        Selection::new().nested("pets", Selection::fields(["id", "name", "type"])),
    )
}

fn prepend_pet(txn: &mut CacheTxn<'_>, data: &Value) -> Result<(), StoreError> {
    let key = txn
        .identify(&data["addPet"])
        .ok_or_else(|| StoreError::Reconcile("addPet returned no pet".into()))?;
    txn.prepend_to_list(&all_pets_key(), "pets", optistack_model::FieldValue::Ref(key))
}

fn add_pet(name: &str) -> MutationRequest<AddPet> {
    MutationRequest::new(AddPetVars {
        name: name.into(),
        kind: "DOG".into(),
    })
    .optimistic(AddPetData {
        add_pet: Pet::new("temp", name, "DOG"),
    })
    .reconcile(prepend_pet)
}

fn add_pet_reply(id: &str, name: &str) -> Value {
    json!({"addPet": {"__typename": "Pet", "id": id, "name": name, "type": "DOG"}})
}

fn rename(id: &str, name: &str) -> MutationRequest<RenamePet> {
    let payload = json!({"renamePet": {"__typename": "Pet", "id": id, "name": name}});
    MutationRequest::new(json!({"id": id, "name": name})).optimistic(payload)
}

fn rename_reply(id: &str, name: &str) -> Value {
    json!({"renamePet": {"__typename": "Pet", "id": id, "name": name}})
}

async fn seeded_client(transport: Arc<MockTransport>, config: ClientConfig) -> Client {
    let schema = SchemaRegistry::new().with(EntitySchema::new("Pet"));
    let client = Client::new(schema, transport, config);
    client
        .write_query(
            &all_pets_doc(),
            &json!({}),
            &json!({"pets": [
                {"__typename": "Pet", "id": "1", "name": "Tom", "type": "CAT"},
                {"__typename": "Pet", "id": "2", "name": "Fido", "type": "DOG"}
            ]}),
        )
        .await
        .unwrap();
    client
}

fn ids(state: &QueryState) -> Vec<String> {
    state.data().unwrap()["pets"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap().to_string())
        .collect()
}

fn names(state: &QueryState) -> Vec<String> {
    state.data().unwrap()["pets"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap().to_string())
        .collect()
}

async fn name_of(client: &Client, id: &str) -> Option<String> {
    client
        .read_entity(&EntityKey::new("Pet", id))
        .await
        .unwrap()
        .and_then(|r| r.get_str("name").map(str::to_string))
}

async fn observe_pets(client: &Client) -> Subscription {
    client.observe(&all_pets_doc(), &json!({})).await.unwrap()
}

// ── Create pet ───────────────────────────────────────────────────

#[tokio::test]
async fn optimistic_create_pet_notifies_twice() {
    let transport = Arc::new(MockTransport::new());
    let client = seeded_client(transport.clone(), ClientConfig::default()).await;
    let mut sub = observe_pets(&client).await;
    assert_eq!(ids(sub.initial()), vec!["1", "2"]);

    let mut reply = transport.defer("AddPet");
    let task = tokio::spawn({
        let client = client.clone();
        async move { client.mutate(add_pet("Rex")).await }
    });
    let operation = reply.requested().await.unwrap();
    assert_eq!(operation.variables, json!({"name": "Rex", "type": "DOG"}));

    let optimistic = sub.try_recv().expect("optimistic notification");
    assert_eq!(ids(&optimistic.state), vec!["temp", "1", "2"]);
    assert_eq!(client.optimistic_layer_count().await.unwrap(), 1);
    assert_eq!(client.pending_mutations().await.unwrap().len(), 1);

    reply.resolve(add_pet_reply("42", "Rex"));
    let result = task.await.unwrap().unwrap();
    assert_eq!(result.data.add_pet, Pet::new("42", "Rex", "DOG"));

    let committed = sub.try_recv().expect("commit notification");
    assert!(committed.revision > optimistic.revision);
    assert_eq!(ids(&committed.state), vec!["42", "1", "2"]);
    assert_eq!(names(&committed.state).iter().filter(|n| *n == "Rex").count(), 1);
    assert!(sub.try_recv().is_none());

    assert_eq!(client.optimistic_layer_count().await.unwrap(), 0);
    assert!(client.read_entity(&EntityKey::new("Pet", "temp")).await.unwrap().is_none());
    let record = client.mutation_record(result.id).await.unwrap().unwrap();
    assert_eq!(record.status, MutationStatus::Committed);
    assert_eq!(record.error, None);
}

#[tokio::test]
async fn identical_commit_still_notifies_with_same_data() {
    let transport = Arc::new(MockTransport::new());
    let client = seeded_client(transport.clone(), ClientConfig::default()).await;
    let mut sub = client
        .observe(&all_pets_doc(), &json!({}))
        .await
        .unwrap();

    transport.reply("RenamePet", rename_reply("1", "Max"));
    client.mutate(rename("1", "Max")).await.unwrap();

    let notifications = sub.drain();
    assert_eq!(notifications.len(), 2);
    assert_eq!(notifications[0].state, notifications[1].state);
    assert_eq!(names(&notifications[1].state), vec!["Max", "Fido"]);
}

#[tokio::test]
async fn non_optimistic_mutation_notifies_once() {
    let transport = Arc::new(MockTransport::new());
    let client = seeded_client(transport.clone(), ClientConfig::default()).await;
    let mut sub = observe_pets(&client).await;

    transport.reply("AddPet", add_pet_reply("42", "Rex"));
    let request = MutationRequest::<AddPet>::new(AddPetVars {
        name: "Rex".into(),
        kind: "DOG".into(),
    })
    .reconcile(prepend_pet);
    client.mutate(request).await.unwrap();

    let notifications = sub.drain();
    assert_eq!(notifications.len(), 1);
    assert_eq!(ids(&notifications[0].state), vec!["42", "1", "2"]);
}

// ── Rejection ────────────────────────────────────────────────────

#[tokio::test]
async fn network_error_reverts_list() {
    let transport = Arc::new(MockTransport::new());
    let client = seeded_client(transport.clone(), ClientConfig::default()).await;
    let mut sub = observe_pets(&client).await;

    transport.fail("AddPet", "connection reset");
    let err = client.mutate(add_pet("Rex")).await.unwrap_err();
    assert!(err.is_network(), "{err}");

    let notifications = sub.drain();
    assert_eq!(notifications.len(), 2);
    assert_eq!(ids(&notifications[0].state), vec!["temp", "1", "2"]);
    assert_eq!(&notifications[1].state, sub.initial());
    assert_eq!(client.optimistic_layer_count().await.unwrap(), 0);

    let history = client.mutation_history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, MutationStatus::Rejected);
    assert!(history[0].error.as_deref().unwrap().contains("connection reset"));
}

#[tokio::test]
async fn server_errors_reject() {
    let transport = Arc::new(MockTransport::new());
    let client = seeded_client(transport.clone(), ClientConfig::default()).await;

    transport.respond("AddPet", optistack_client::Response::error("name taken"));
    let err = client.mutate(add_pet("Rex")).await.unwrap_err();

    assert!(matches!(err, ClientError::Server(ref msg) if msg.contains("name taken")));
    assert!(err.is_rejection());
    let data = client.read_query(&all_pets_doc(), &json!({})).await.unwrap();
    assert_eq!(data["pets"].as_array().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn timeout_rejects() {
    let transport = Arc::new(MockTransport::new());
    let config = ClientConfig {
        timeout_ms: 50,
        ..Default::default()
    };
    let client = seeded_client(transport.clone(), config).await;

    transport.hang("AddPet");
    let err = client.mutate(add_pet("Rex")).await.unwrap_err();

    assert!(matches!(err, ClientError::Timeout(50)));
    assert!(err.is_network());
    assert_eq!(client.optimistic_layer_count().await.unwrap(), 0);
    assert!(client.pending_mutations().await.unwrap().is_empty());
}

// ── Validation ───────────────────────────────────────────────────

#[tokio::test]
async fn invalid_variables_fail_before_overlay() {
    let transport = Arc::new(MockTransport::new());
    let client = seeded_client(transport.clone(), ClientConfig::default()).await;
    let mut sub = observe_pets(&client).await;

    let err = client.mutate(add_pet("  ")).await.unwrap_err();

    assert!(matches!(err, ClientError::Validation(_)));
    assert!(transport.sent().is_empty());
    assert!(sub.try_recv().is_none());
    assert_eq!(client.optimistic_layer_count().await.unwrap(), 0);
}

#[tokio::test]
async fn unidentifiable_optimistic_payload_is_invalid() {
    let transport = Arc::new(MockTransport::new());
    let client = seeded_client(transport.clone(), ClientConfig::default()).await;

    let request = MutationRequest::<RenamePet>::new(json!({"name": "Max"}))
        .optimistic(json!({"renamePet": {"__typename": "Pet", "name": "Max"}}));
    let err = client.mutate(request).await.unwrap_err();

    assert!(matches!(err, ClientError::Validation(_)));
    assert!(transport.sent().is_empty());
    assert!(client.pending_mutations().await.unwrap().is_empty());
}

#[tokio::test]
async fn non_object_optimistic_payload_is_invalid() {
    let transport = Arc::new(MockTransport::new());
    let client = seeded_client(transport.clone(), ClientConfig::default()).await;

    let request = MutationRequest::<RenamePet>::new(json!({})).optimistic(json!(["Max"]));
    let err = client.mutate(request).await.unwrap_err();
    assert!(matches!(err, ClientError::Validation(_)));
}

// ── Reconciliation ───────────────────────────────────────────────

#[tokio::test]
async fn reconciliation_error_keeps_canonical_write() {
    let transport = Arc::new(MockTransport::new());
    let client = seeded_client(transport.clone(), ClientConfig::default()).await;

    transport.reply("AddPet", add_pet_reply("42", "Rex"));
    let request = MutationRequest::<AddPet>::new(AddPetVars {
        name: "Rex".into(),
        kind: "DOG".into(),
    })
    .reconcile(|txn: &mut CacheTxn<'_>, _: &Value| {
        if txn.is_optimistic() {
            Ok(())
        } else {
            Err(StoreError::Reconcile("list missing".into()))
        }
    });
    let err = client.mutate(request).await.unwrap_err();

    let mutation = match &err {
        ClientError::Reconciliation { mutation, .. } => *mutation,
        other => panic!("expected reconciliation error, got {other:?}"),
    };
    assert_eq!(name_of(&client, "42").await.as_deref(), Some("Rex"));
    let record = client.mutation_record(mutation).await.unwrap().unwrap();
    assert_eq!(record.status, MutationStatus::Committed);
    assert!(record.error.is_some());
}

async fn client_with_scalar_pets(transport: Arc<MockTransport>) -> Client {
    let schema = SchemaRegistry::new().with(EntitySchema::new("Pet"));
    let client = Client::new(schema, transport, ClientConfig::default());
    client
        .write_query(&all_pets_doc(), &json!({}), &json!({"pets": 3}))
        .await
        .unwrap();
    client
}

#[tokio::test]
async fn failed_optimistic_reconcile_keeps_layer_until_rejection() {
    let transport = Arc::new(MockTransport::new());
    let client = client_with_scalar_pets(transport.clone()).await;
    let temp = EntityKey::new("Pet", "temp");

    let mut reply = transport.defer("AddPet");
    let task = tokio::spawn({
        let client = client.clone();
        async move { client.mutate(add_pet("Rex")).await }
    });
    reply.requested().await.unwrap();

    assert_eq!(client.optimistic_layer_count().await.unwrap(), 1);
    assert!(client.read_entity(&temp).await.unwrap().is_some());
    let pending = client.pending_mutations().await.unwrap();
    assert_eq!(pending.len(), 1);
    let error = pending[0].error.as_deref().unwrap();
    assert!(error.contains("`pets` is not a list"), "{error}");

    reply.reject("offline");
    let err = task.await.unwrap().unwrap_err();
    assert!(err.is_network());

    assert_eq!(client.optimistic_layer_count().await.unwrap(), 0);
    assert!(client.read_entity(&temp).await.unwrap().is_none());
    assert!(client.pending_mutations().await.unwrap().is_empty());
    let history = client.mutation_history().await.unwrap();
    assert_eq!(history[0].status, MutationStatus::Rejected);
    assert!(history[0].error.as_deref().unwrap().contains("offline"));
}

#[tokio::test]
async fn failed_optimistic_reconcile_layer_dropped_on_commit() {
    let transport = Arc::new(MockTransport::new());
    let client = client_with_scalar_pets(transport.clone()).await;

    transport.reply("AddPet", add_pet_reply("42", "Rex"));
    let err = client.mutate(add_pet("Rex")).await.unwrap_err();

    // the canonical reconciliation hits the same non-list field
    assert!(matches!(err, ClientError::Reconciliation { .. }));
    assert_eq!(transport.sent_count("AddPet"), 1);
    assert_eq!(client.optimistic_layer_count().await.unwrap(), 0);
    assert!(client.read_entity(&EntityKey::new("Pet", "temp")).await.unwrap().is_none());
    assert_eq!(name_of(&client, "42").await.as_deref(), Some("Rex"));
}

#[tokio::test]
async fn reconcile_never_runs_on_rejection() {
    let transport = Arc::new(MockTransport::new());
    let client = seeded_client(transport.clone(), ClientConfig::default()).await;
    let calls = Arc::new(std::sync::Mutex::new(Vec::new()));

    transport.fail("AddPet", "offline");
    let seen = calls.clone();
    let request = MutationRequest::<AddPet>::new(AddPetVars {
        name: "Rex".into(),
        kind: "DOG".into(),
    })
    .optimistic(AddPetData {
        add_pet: Pet::new("temp", "Rex", "DOG"),
    })
    .reconcile(move |txn: &mut CacheTxn<'_>, _: &Value| {
        seen.lock().unwrap().push(txn.is_optimistic());
        Ok(())
    });
    client.mutate(request).await.unwrap_err();

    assert_eq!(*calls.lock().unwrap(), vec![true]);
}

// ── Concurrency ──────────────────────────────────────────────────

#[tokio::test]
async fn later_commit_survives_earlier_rejection() {
    let transport = Arc::new(MockTransport::new());
    let client = seeded_client(transport.clone(), ClientConfig::default()).await;

    let mut first = transport.defer("RenamePet");
    let mut second = transport.defer("RenamePet");
    let m1 = tokio::spawn({
        let client = client.clone();
        async move { client.mutate(rename("1", "A")).await }
    });
    first.requested().await.unwrap();
    let m2 = tokio::spawn({
        let client = client.clone();
        async move { client.mutate(rename("1", "B")).await }
    });
    second.requested().await.unwrap();
    assert_eq!(name_of(&client, "1").await.as_deref(), Some("B"));

    second.resolve(rename_reply("1", "B2"));
    m2.await.unwrap().unwrap();
    assert_eq!(name_of(&client, "1").await.as_deref(), Some("B2"));

    first.reject("offline");
    m1.await.unwrap().unwrap_err();
    assert_eq!(name_of(&client, "1").await.as_deref(), Some("B2"));
}

#[tokio::test]
async fn later_commit_survives_earlier_commit() {
    let transport = Arc::new(MockTransport::new());
    let client = seeded_client(transport.clone(), ClientConfig::default()).await;

    let mut first = transport.defer("RenamePet");
    let mut second = transport.defer("RenamePet");
    let m1 = tokio::spawn({
        let client = client.clone();
        async move { client.mutate(rename("1", "A")).await }
    });
    first.requested().await.unwrap();
    let m2 = tokio::spawn({
        let client = client.clone();
        async move { client.mutate(rename("1", "B")).await }
    });
    second.requested().await.unwrap();

    second.resolve(rename_reply("1", "B2"));
    m2.await.unwrap().unwrap();
    first.resolve(rename_reply("1", "A1"));
    m1.await.unwrap().unwrap();

    assert_eq!(name_of(&client, "1").await.as_deref(), Some("B2"));
    assert_eq!(client.optimistic_layer_count().await.unwrap(), 0);
}

#[tokio::test]
async fn mutation_ids_are_sequential() {
    let transport = Arc::new(MockTransport::new());
    let client = seeded_client(transport.clone(), ClientConfig::default()).await;

    transport.reply("RenamePet", rename_reply("1", "A"));
    transport.reply("RenamePet", rename_reply("1", "B"));
    let a = client.mutate(rename("1", "A")).await.unwrap();
    let b = client.mutate(rename("1", "B")).await.unwrap();

    assert_eq!(b.id, a.id.next());
}

// ── Cancellation ─────────────────────────────────────────────────

#[tokio::test]
async fn unsubscribed_observer_gets_nothing_but_store_updates() {
    let transport = Arc::new(MockTransport::new());
    let client = seeded_client(transport.clone(), ClientConfig::default()).await;
    let mut leaving = observe_pets(&client).await;
    let mut staying = observe_pets(&client).await;

    let mut reply = transport.defer("AddPet");
    let task = tokio::spawn({
        let client = client.clone();
        async move { client.mutate(add_pet("Rex")).await }
    });
    reply.requested().await.unwrap();
    assert_eq!(leaving.drain().len(), 1);
    assert!(client.unobserve(leaving.id()).await.unwrap());

    reply.resolve(add_pet_reply("42", "Rex"));
    task.await.unwrap().unwrap();

    assert!(leaving.recv().await.is_none());
    let notifications = staying.drain();
    assert_eq!(notifications.len(), 2);
    assert_eq!(ids(&notifications[1].state), vec!["42", "1", "2"]);
}

#[tokio::test]
async fn dropped_caller_still_completes_mutation() {
    let transport = Arc::new(MockTransport::new());
    let client = seeded_client(transport.clone(), ClientConfig::default()).await;

    let mut reply = transport.defer("AddPet");
    let task = tokio::spawn({
        let client = client.clone();
        async move { client.mutate(add_pet("Rex")).await }
    });
    reply.requested().await.unwrap();
    task.abort();
    reply.resolve(add_pet_reply("42", "Rex"));

    for _ in 0..100 {
        if client.pending_mutations().await.unwrap().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(client.pending_mutations().await.unwrap().is_empty());
    assert_eq!(name_of(&client, "42").await.as_deref(), Some("Rex"));
    assert_eq!(client.optimistic_layer_count().await.unwrap(), 0);
}

// ── History ──────────────────────────────────────────────────────

#[tokio::test]
async fn history_is_bounded() {
    let transport = Arc::new(MockTransport::new());
    let config = ClientConfig {
        mutation_history: 2,
        ..Default::default()
    };
    let client = seeded_client(transport.clone(), config).await;

    for name in ["A", "B", "C"] {
        transport.reply("RenamePet", rename_reply("1", name));
        client.mutate(rename("1", name)).await.unwrap();
    }

    let history = client.mutation_history().await.unwrap();
    let names: Vec<_> = history.iter().map(|r| r.variables["name"].clone()).collect();
    assert_eq!(names, vec![json!("B"), json!("C")]);
}
