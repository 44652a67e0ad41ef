//! The client: cache, mutation executor and notification bus behind one
//! cloneable handle.

use crate::bus::{NotificationBus, Subscription, Watch};
use crate::error::{ClientError, ClientResult};
use crate::mutation::{Mutation, MutationLog, MutationRecord, MutationRequest, MutationResult, MutationStatus};
use crate::transport::{Operation, Response, Transport};
use optistack_model::{EntityRecord, Fragment, QueryDocument, SchemaRegistry};
use optistack_store::{NormalizedCache, ReadBound, ReconcileFn, StoreError, TxnTarget};
use optistack_types::{EntityKey, MutationId, ObserverId, QueryKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Configuration for the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name used in log output.
    pub name: String,
    /// Deadline for one transport round trip (ms).
    pub timeout_ms: u64,
    /// Completed mutation records kept for inspection.
    pub mutation_history: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "optistack-client".to_string(),
            timeout_ms: 30_000,
            mutation_history: 128,
        }
    }
}

/// Where [`Client::query`] looks for data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Serve from the cache, fetching only on a miss.
    #[default]
    CacheFirst,
    /// Always fetch and write the result to the cache.
    NetworkOnly,
    /// Never fetch; a miss is an error.
    CacheOnly,
}

struct ClientState {
    cache: NormalizedCache,
    bus: NotificationBus,
    log: MutationLog,
    next_mutation: MutationId,
    disposed: bool,
}

impl ClientState {
    fn allocate_mutation_id(&mut self) -> MutationId {
        let id = self.next_mutation;
        self.next_mutation = id.next();
        id
    }

    /// Ends a state transition: one notification pass for everything
    /// written since the previous one.
    fn publish(&mut self) -> usize {
        let changes = self.cache.flush();
        self.bus.notify(&mut self.cache, &changes)
    }

    fn observe(&mut self, watch: Watch) -> Subscription {
        self.bus.register(watch, &mut self.cache)
    }

    /// idle → pending. Applies the optimistic layer, if any, and notifies.
    fn begin_mutation(
        &mut self,
        name: &str,
        variables: Value,
        optimistic: Option<Value>,
        reconcile: Option<ReconcileFn>,
    ) -> ClientResult<MutationId> {
        let id = self.allocate_mutation_id();
        self.cache.begin_mutation(id);
        let mut record = MutationRecord::pending(id, name, variables, optimistic.clone());
        if let Some(data) = optimistic {
            if let Err(e) = self.cache.push_optimistic(id, data, reconcile) {
                if self.cache.optimistic().layer(id).is_none() {
                    // The payload itself was rejected; nothing was written.
                    self.cache.settle_mutation(id);
                    return Err(match e {
                        StoreError::InvalidPayload(msg) => ClientError::Validation(msg),
                        other => other.into(),
                    });
                }
                // The layer stays, with the writes made so far, until the
                // mutation settles.
                warn!(mutation = %id, error = %e, "optimistic reconciliation failed");
                record.error = Some(format!("optimistic reconciliation failed: {e}"));
            }
        }
        self.log.begin(record);
        let notified = self.publish();
        debug!(mutation = %id, name, notified, "mutation pending");
        Ok(id)
    }

    /// pending → committed.
    fn commit(&mut self, id: MutationId, data: &Value, reconcile: Option<&ReconcileFn>) -> ClientResult<()> {
        self.cache.remove_optimistic(id);
        if let Err(e) = self.cache.commit_mutation(id, data) {
            let err = ClientError::InvalidResponse(e.to_string());
            self.reject(id, &err);
            return Err(err);
        }
        let reconciled = match reconcile {
            Some(f) => self
                .cache
                .reconcile(TxnTarget::Canonical, f, data)
                .map_err(|source| ClientError::Reconciliation { mutation: id, source }),
            None => Ok(()),
        };
        self.cache.settle_mutation(id);
        self.log.finish(
            id,
            MutationStatus::Committed,
            reconciled.as_ref().err().map(ToString::to_string),
        );
        let notified = self.publish();
        match &reconciled {
            Ok(()) => info!(mutation = %id, notified, "mutation committed"),
            Err(e) => warn!(mutation = %id, error = %e, "mutation committed, reconciliation failed"),
        }
        reconciled
    }

    /// pending → rejected. The layer is dropped; no reconciliation runs.
    fn reject(&mut self, id: MutationId, error: &ClientError) {
        self.cache.remove_optimistic(id);
        self.cache.settle_mutation(id);
        self.log.finish(id, MutationStatus::Rejected, Some(error.to_string()));
        let notified = self.publish();
        warn!(mutation = %id, error = %error, notified, "mutation rejected");
    }
}

struct Inner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    state: RwLock<ClientState>,
}

/// A client data layer instance.
///
/// Cheap to clone; clones share one cache. All state is dropped by
/// [`dispose`](Self::dispose), after which every call returns
/// [`ClientError::Disposed`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Creates a client with the given entity schema and transport.
    pub fn new(schema: SchemaRegistry, transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        info!(name = %config.name, types = schema.len(), "client created");
        let log = MutationLog::new(config.mutation_history);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                state: RwLock::new(ClientState {
                    cache: NormalizedCache::new(schema),
                    bus: NotificationBus::new(),
                    log,
                    next_mutation: MutationId::first(),
                    disposed: false,
                }),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    async fn read_state(&self) -> ClientResult<RwLockReadGuard<'_, ClientState>> {
        let state = self.inner.state.read().await;
        if state.disposed {
            return Err(ClientError::Disposed);
        }
        Ok(state)
    }

    async fn write_state(&self) -> ClientResult<RwLockWriteGuard<'_, ClientState>> {
        let state = self.inner.state.write().await;
        if state.disposed {
            return Err(ClientError::Disposed);
        }
        Ok(state)
    }

    async fn dispatch(&self, operation: Operation) -> ClientResult<Response> {
        let timeout_ms = self.inner.config.timeout_ms;
        debug!(name = %operation.name, kind = ?operation.kind, "dispatching operation");
        tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.inner.transport.send(operation),
        )
        .await
        .map_err(|_| ClientError::Timeout(timeout_ms))?
    }

    // ── Mutations ────────────────────────────────────────────────

    /// Runs mutation `M`.
    ///
    /// Variables are validated before anything is written. With an
    /// optimistic payload, observers are notified immediately and once more
    /// when the server answers; without one, only once on commit.
    ///
    /// The network round trip and the commit or rollback run on a spawned
    /// task, so the mutation completes even if this future is dropped.
    pub async fn mutate<M: Mutation>(&self, request: MutationRequest<M>) -> ClientResult<MutationResult<M::Output>> {
        let MutationRequest {
            variables,
            optimistic,
            reconcile,
        } = request;
        M::validate(&variables).map_err(ClientError::Validation)?;
        let variables = serde_json::to_value(&variables)?;
        let optimistic = optimistic.as_ref().map(serde_json::to_value).transpose()?;
        if let Some(data) = &optimistic {
            if !data.is_object() {
                return Err(ClientError::Validation(format!(
                    "optimistic payload of {} must be an object",
                    M::NAME
                )));
            }
        }

        let id = self
            .write_state()
            .await?
            .begin_mutation(M::NAME, variables.clone(), optimistic, reconcile.clone())?;

        let client = self.clone();
        let operation = Operation::mutation(M::NAME, variables);
        let data = tokio::spawn(async move { client.complete_mutation(id, operation, reconcile).await })
            .await
            .map_err(|e| ClientError::TaskFailed(e.to_string()))??;

        let data = serde_json::from_value(data).map_err(|e| {
            ClientError::InvalidResponse(format!("{} result does not match its type: {e}", M::NAME))
        })?;
        Ok(MutationResult { id, data })
    }

    async fn complete_mutation(
        &self,
        id: MutationId,
        operation: Operation,
        reconcile: Option<ReconcileFn>,
    ) -> ClientResult<Value> {
        let response = self.dispatch(operation).await.and_then(Response::into_data);
        let mut state = self.write_state().await?;
        match response {
            Ok(data) => {
                state.commit(id, &data, reconcile.as_ref())?;
                Ok(data)
            }
            Err(e) => {
                state.reject(id, &e);
                Err(e)
            }
        }
    }

    pub async fn mutation_record(&self, id: MutationId) -> ClientResult<Option<MutationRecord>> {
        Ok(self.read_state().await?.log.get(id).cloned())
    }

    /// Mutations awaiting a server reply, in sequence order.
    pub async fn pending_mutations(&self) -> ClientResult<Vec<MutationRecord>> {
        Ok(self.read_state().await?.log.pending())
    }

    /// Recently completed mutations, oldest first.
    pub async fn mutation_history(&self) -> ClientResult<Vec<MutationRecord>> {
        Ok(self.read_state().await?.log.history())
    }

    pub async fn optimistic_layer_count(&self) -> ClientResult<usize> {
        Ok(self.read_state().await?.cache.optimistic_layer_count())
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Materializes `document`, fetching it according to `policy`.
    pub async fn query(&self, document: &QueryDocument, variables: &Value, policy: FetchPolicy) -> ClientResult<Value> {
        if policy != FetchPolicy::NetworkOnly {
            let mut state = self.write_state().await?;
            match state.cache.resolve(document, variables) {
                Ok(materialized) => return Ok(materialized.data),
                Err(e) if e.is_cache_miss() && policy == FetchPolicy::CacheFirst => {
                    debug!(query = %document.name, error = %e, "cache miss, fetching");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let operation = Operation::query(&document.name, variables.clone());
        let data = self.dispatch(operation).await?.into_data()?;

        let mut state = self.write_state().await?;
        state
            .cache
            .write_query_result(&QueryKey::new(&document.name, variables), &data)?;
        state.publish();
        Ok(state.cache.resolve(document, variables)?.data)
    }

    /// Reads `document` from the cache without fetching or registering it.
    pub async fn read_query(&self, document: &QueryDocument, variables: &Value) -> ClientResult<Value> {
        let state = self.read_state().await?;
        Ok(state.cache.view(ReadBound::Latest).resolve(document, variables)?.data)
    }

    /// The entity as observers currently see it.
    pub async fn read_entity(&self, key: &EntityKey) -> ClientResult<Option<EntityRecord>> {
        Ok(self.read_state().await?.cache.read_entity(key))
    }

    /// Writes `data` as the canonical result of `document` and notifies.
    pub async fn write_query(&self, document: &QueryDocument, variables: &Value, data: &Value) -> ClientResult<()> {
        let mut state = self.write_state().await?;
        state
            .cache
            .write_query_result(&QueryKey::new(&document.name, variables), data)?;
        state.publish();
        Ok(())
    }

    /// Removes a canonical entity and notifies. Returns whether it existed.
    pub async fn evict(&self, key: &EntityKey) -> ClientResult<bool> {
        let mut state = self.write_state().await?;
        let removed = state.cache.evict_entity(key);
        state.publish();
        Ok(removed)
    }

    // ── Observers ────────────────────────────────────────────────

    pub async fn observe(&self, document: &QueryDocument, variables: &Value) -> ClientResult<Subscription> {
        let watch = Watch::Query {
            document: document.clone(),
            variables: variables.clone(),
        };
        Ok(self.write_state().await?.observe(watch))
    }

    pub async fn observe_fragment(&self, fragment: &Fragment, key: &EntityKey) -> ClientResult<Subscription> {
        let watch = Watch::Fragment {
            fragment: fragment.clone(),
            key: key.clone(),
        };
        Ok(self.write_state().await?.observe(watch))
    }

    /// Stops notifications to `id`. Pending mutations still complete.
    pub async fn unobserve(&self, id: ObserverId) -> ClientResult<bool> {
        let mut state = self.write_state().await?;
        let ClientState { bus, cache, .. } = &mut *state;
        Ok(bus.unregister(id, cache))
    }

    pub async fn observer_count(&self) -> ClientResult<usize> {
        Ok(self.read_state().await?.bus.len())
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Drops all cached data, layers and observers. Mutations still in
    /// flight finish with [`ClientError::Disposed`].
    pub async fn dispose(&self) {
        let mut state = self.inner.state.write().await;
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.cache.clear();
        state.bus.clear();
        state.log.clear();
        info!(name = %self.inner.config.name, "client disposed");
    }

    pub async fn is_disposed(&self) -> bool {
        self.inner.state.read().await.disposed
    }
}
