//! Observer notification bus.
//!
//! Observers register a [`Watch`] and get back a [`Subscription`] holding the
//! initial materialized state and a channel for later changes. Each call to
//! [`NotificationBus::notify`] is one state transition: every observer whose
//! query or dependencies intersect the [`ChangeSet`] is re-materialized and
//! sent exactly one [`Notification`].

use optistack_model::{Fragment, QueryDocument};
use optistack_store::{ChangeSet, Materialized, NormalizedCache, StoreError, StoreResult};
use optistack_types::{EntityKey, ObserverId, QueryKey};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::mpsc;
use tracing::debug;

/// What an observer is watching.
#[derive(Debug, Clone)]
pub enum Watch {
    Query {
        document: QueryDocument,
        variables: Value,
    },
    Fragment {
        fragment: Fragment,
        key: EntityKey,
    },
}

impl Watch {
    /// The cached query this watch reads, if any.
    pub fn query_key(&self) -> Option<QueryKey> {
        match self {
            Self::Query { document, variables } => Some(QueryKey::new(&document.name, variables)),
            Self::Fragment { .. } => None,
        }
    }

    fn materialize(&self, cache: &mut NormalizedCache) -> (QueryState, BTreeSet<EntityKey>) {
        match self {
            Self::Query { document, variables } => {
                let result = cache.resolve(document, variables);
                let key = QueryKey::new(&document.name, variables);
                let dependencies = cache.queries().dependencies_of(&key).cloned().unwrap_or_default();
                (QueryState::from_result(result), dependencies)
            }
            Self::Fragment { fragment, key } => {
                let result = cache.resolve_fragment(fragment, key);
                let mut dependencies = match &result {
                    Ok(materialized) => materialized.dependencies.clone(),
                    Err(_) => BTreeSet::new(),
                };
                dependencies.insert(key.clone());
                (QueryState::from_result(result), dependencies)
            }
        }
    }

    fn is_affected(&self, dependencies: &BTreeSet<EntityKey>, changes: &ChangeSet) -> bool {
        let query_changed = self.query_key().is_some_and(|key| changes.touches_query(&key));
        query_changed || changes.touches_any(dependencies)
    }
}

/// Materialized state delivered to an observer.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState {
    Ready(Value),
    /// The cache cannot fully materialize the watch; carries the miss path.
    Missing(String),
}

impl QueryState {
    fn from_result(result: StoreResult<Materialized>) -> Self {
        match result {
            Ok(materialized) => Self::Ready(materialized.data),
            Err(StoreError::CacheMiss { path }) => Self::Missing(path),
            Err(e) => Self::Missing(e.to_string()),
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Ready(data) => Some(data),
            Self::Missing(_) => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// One change delivered to one observer.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub observer: ObserverId,
    /// Bus revision of the transition that produced this notification.
    pub revision: u64,
    pub state: QueryState,
}

/// Receiving side of an observer registration.
///
/// Dropping the subscription stops delivery; the bus forgets the observer on
/// its next transition.
#[derive(Debug)]
pub struct Subscription {
    id: ObserverId,
    initial: QueryState,
    receiver: mpsc::UnboundedReceiver<Notification>,
}

impl Subscription {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// State at registration time.
    pub fn initial(&self) -> &QueryState {
        &self.initial
    }

    /// Waits for the next notification. `None` once the observer has been
    /// unregistered or the client disposed.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    /// The next already-delivered notification, if any.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }

    /// Every already-delivered notification.
    pub fn drain(&mut self) -> Vec<Notification> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

struct Observer {
    watch: Watch,
    dependencies: BTreeSet<EntityKey>,
    sender: mpsc::UnboundedSender<Notification>,
}

/// Fan-out of cache changes to registered observers.
#[derive(Default)]
pub struct NotificationBus {
    observers: HashMap<ObserverId, Observer>,
    revision: u64,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `watch` and materializes its initial state.
    pub fn register(&mut self, watch: Watch, cache: &mut NormalizedCache) -> Subscription {
        let id = ObserverId::new();
        let (initial, dependencies) = watch.materialize(cache);
        let (sender, receiver) = mpsc::unbounded_channel();
        debug!(observer = %id, dependencies = dependencies.len(), "observer registered");
        self.observers.insert(
            id,
            Observer {
                watch,
                dependencies,
                sender,
            },
        );
        Subscription {
            id,
            initial,
            receiver,
        }
    }

    /// Removes an observer. Its subscription's channel closes.
    pub fn unregister(&mut self, id: ObserverId, cache: &mut NormalizedCache) -> bool {
        let Some(observer) = self.observers.remove(&id) else {
            return false;
        };
        debug!(observer = %id, "observer unregistered");
        self.release(&observer.watch, cache);
        true
    }

    /// Drops the dependency links of `watch`'s query once nothing watches it.
    fn release(&self, watch: &Watch, cache: &mut NormalizedCache) {
        let Some(key) = watch.query_key() else {
            return;
        };
        let watched = self
            .observers
            .values()
            .any(|observer| observer.watch.query_key().as_ref() == Some(&key));
        if !watched {
            cache.release_query(&key);
        }
    }

    /// Delivers one notification to every observer affected by `changes`.
    /// Returns how many were delivered.
    pub fn notify(&mut self, cache: &mut NormalizedCache, changes: &ChangeSet) -> usize {
        if changes.is_empty() {
            return 0;
        }
        self.revision += 1;
        let revision = self.revision;
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, observer) in &mut self.observers {
            if observer.sender.is_closed() {
                closed.push(*id);
                continue;
            }
            if !observer.watch.is_affected(&observer.dependencies, changes) {
                continue;
            }
            let (state, dependencies) = observer.watch.materialize(cache);
            observer.dependencies = dependencies;
            let notification = Notification {
                observer: *id,
                revision,
                state,
            };
            if observer.sender.send(notification).is_ok() {
                delivered += 1;
            } else {
                closed.push(*id);
            }
        }

        for id in closed {
            debug!(observer = %id, "dropping observer with closed subscription");
            if let Some(observer) = self.observers.remove(&id) {
                self.release(&observer.watch, cache);
            }
        }
        debug!(revision, delivered, changed = changes.len(), "notified observers");
        delivered
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Drops every observer, closing all subscriptions.
    pub fn clear(&mut self) {
        self.observers.clear();
    }
}
