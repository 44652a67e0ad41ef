//! Pet-store domain and in-process backend for the optistack demo.

use async_trait::async_trait;
use optistack_client::{
    ClientConfig, ClientError, ClientResult, Mutation, MutationRequest, Operation, OperationKind, Response, Transport,
};
use optistack_model::{EntitySchema, FieldValue, Fragment, QueryDocument, SchemaRegistry, Selection};
use optistack_store::{CacheTxn, StoreError, StoreResult};
use optistack_types::QueryKey;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

pub const ALL_PETS: &str = "AllPets";
pub const ADD_PET: &str = "AddPet";
/// Prefix of the placeholder id of an optimistically added pet.
pub const TEMP_ID_PREFIX: &str = "temp-";

const MAX_NAME_LEN: usize = 64;

static NEXT_TEMP_ID: AtomicU64 = AtomicU64::new(1);

/// A placeholder id no other pending pet in this process shares.
pub fn temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed))
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

// ── Domain ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PetType {
    Dog,
    Cat,
}

impl fmt::Display for PetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dog => write!(f, "DOG"),
            Self::Cat => write!(f, "CAT"),
        }
    }
}

impl FromStr for PetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DOG" => Ok(Self::Dog),
            "CAT" => Ok(Self::Cat),
            _ => Err(format!("unknown pet type `{s}` (expected DOG or CAT)")),
        }
    }
}

fn pet_typename() -> String {
    "Pet".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pet {
    #[serde(rename = "__typename", default = "pet_typename")]
    pub typename: String,
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PetType,
}

impl Pet {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: PetType) -> Self {
        Self {
            typename: pet_typename(),
            id: id.into(),
            name: name.into(),
            kind,
        }
    }
}

/// Variables of [`AddPet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPet {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PetType,
}

impl FromStr for NewPet {
    type Err = String;

    /// Parses `NAME` or `NAME:TYPE`; the type defaults to DOG.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, kind) = match s.rsplit_once(':') {
            Some((name, kind)) => (name, kind.parse()?),
            None => (s, PetType::Dog),
        };
        Ok(Self {
            name: name.trim().to_string(),
            kind,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPetData {
    #[serde(rename = "addPet")]
    pub add_pet: Pet,
}

/// `mutation AddPet($name, $type) { addPet(...) { ...PetFields } }`
pub struct AddPet;

impl Mutation for AddPet {
    const NAME: &'static str = ADD_PET;
    type Variables = NewPet;
    type Output = AddPetData;

    fn validate(variables: &NewPet) -> Result<(), String> {
        let name = variables.name.trim();
        if name.is_empty() {
            return Err("pet name must not be empty".into());
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(format!("pet name longer than {MAX_NAME_LEN} characters"));
        }
        Ok(())
    }
}

// ── Documents ────────────────────────────────────────────────────

pub fn pet_schema() -> SchemaRegistry {
    SchemaRegistry::new().with(EntitySchema::new("Pet"))
}

/// `fragment PetFields on Pet { id name type }`
pub fn pet_fields() -> Arc<Fragment> {
    Arc::new(Fragment::new("PetFields", "Pet", Selection::fields(["id", "name", "type"])))
}

/// `query AllPets { allPets { ...PetFields } }`
pub fn all_pets_query() -> QueryDocument {
    QueryDocument::new(ALL_PETS, Selection::new().nested("allPets", Selection::new().spread(pet_fields())))
}

/// Inserts the pet returned by `addPet` at the front of `allPets`.
pub fn prepend_added_pet(txn: &mut CacheTxn<'_>, data: &Value) -> StoreResult<()> {
    let key = txn
        .identify(&data["addPet"])
        .ok_or_else(|| StoreError::Reconcile("addPet returned no pet".into()))?;
    txn.prepend_to_list(&QueryKey::named(ALL_PETS), "allPets", FieldValue::Ref(key))
}

/// An `AddPet` request that shows the pet immediately under a fresh
/// [`temp_id`].
pub fn add_pet_request(name: &str, kind: PetType) -> MutationRequest<AddPet> {
    MutationRequest::new(NewPet {
        name: name.to_string(),
        kind,
    })
    .optimistic(AddPetData {
        add_pet: Pet::new(temp_id(), name, kind),
    })
    .reconcile(prepend_added_pet)
}

/// One-line rendering of an `AllPets` result.
pub fn describe_pets(data: &Value) -> String {
    let Some(pets) = data["allPets"].as_array() else {
        return "<no pets>".to_string();
    };
    let names: Vec<String> = pets
        .iter()
        .map(|pet| {
            let name = pet["name"].as_str().unwrap_or("?");
            match pet["id"].as_str() {
                Some(id) if is_temp_id(id) => format!("{name} (pending)"),
                Some(id) => format!("{name} #{id}"),
                None => name.to_string(),
            }
        })
        .collect();
    format!("[{}]", names.join(", "))
}

// ── Configuration ────────────────────────────────────────────────

/// Behavior of the in-process [`PetServer`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Delay before every reply (ms).
    pub latency_ms: u64,
    /// Fail every mutation with a network error.
    pub fail_mutations: bool,
}

/// Contents of the demo's `--config` file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl DemoConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

// ── Server ───────────────────────────────────────────────────────

struct ServerState {
    pets: Vec<Pet>,
    next_id: u64,
}

/// In-memory pet store answering `AllPets` and `AddPet`.
pub struct PetServer {
    config: ServerConfig,
    state: Mutex<ServerState>,
}

impl PetServer {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_pets(config, Vec::new())
    }

    /// A server pre-populated with `(name, type)` pairs, ids counting from 1.
    pub fn with_pets(config: ServerConfig, pets: Vec<(&str, PetType)>) -> Self {
        let pets: Vec<Pet> = pets
            .into_iter()
            .enumerate()
            .map(|(i, (name, kind))| Pet::new((i + 1).to_string(), name, kind))
            .collect();
        let next_id = pets.len() as u64 + 1;
        Self {
            config,
            state: Mutex::new(ServerState { pets, next_id }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current server-side pets, newest first.
    pub async fn pets(&self) -> Vec<Pet> {
        self.state.lock().await.pets.clone()
    }

    async fn add_pet(&self, variables: Value) -> ClientResult<Response> {
        if self.config.fail_mutations {
            return Err(ClientError::Network("pet server unavailable".into()));
        }
        let new_pet: NewPet = match serde_json::from_value(variables) {
            Ok(new_pet) => new_pet,
            Err(e) => return Ok(Response::error(format!("invalid AddPet variables: {e}"))),
        };
        if let Err(msg) = AddPet::validate(&new_pet) {
            return Ok(Response::error(msg));
        }

        let mut state = self.state.lock().await;
        let pet = Pet::new(state.next_id.to_string(), new_pet.name.trim(), new_pet.kind);
        state.next_id += 1;
        state.pets.insert(0, pet.clone());
        debug!(id = %pet.id, name = %pet.name, "server added pet");
        Ok(Response::data(json!({ "addPet": pet })))
    }
}

#[async_trait]
impl Transport for PetServer {
    async fn send(&self, operation: Operation) -> ClientResult<Response> {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
        match (operation.kind, operation.name.as_str()) {
            (OperationKind::Query, ALL_PETS) => {
                let pets = self.pets().await;
                Ok(Response::data(json!({ "allPets": pets })))
            }
            (OperationKind::Mutation, ADD_PET) => self.add_pet(operation.variables).await,
            (kind, name) => Ok(Response::error(format!("unknown {kind:?} operation `{name}`"))),
        }
    }
}
