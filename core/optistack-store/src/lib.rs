//! In-memory normalized cache for optistack.
//!
//! Holds the canonical entity data, the query results composed from it, and
//! the optimistic overlay applied on top while mutations are in flight.
//!
//! # Architecture
//!
//! - [`EntityStore`] owns the canonical record for every [`EntityKey`](optistack_types::EntityKey)
//! - [`QueryCache`] stores query roots (lists of references, not copies) and
//!   indexes which queries depend on which entities
//! - [`OptimisticLayer`] keeps one overlay layer per pending mutation, ordered
//!   by sequence number and never written into the canonical store
//! - [`NormalizedCache`] composes the three, normalizes payloads, materializes
//!   results and accumulates the [`ChangeSet`] of each state transition
//! - [`CacheTxn`] is the read/write handle handed to reconciliation functions

mod cache;
mod entity_store;
mod error;
mod materialize;
mod normalize;
mod overlay;
mod query_cache;
mod txn;

pub use cache::{CacheView, ChangeSet, NormalizedCache, ReadBound};
pub use entity_store::{EntityStore, WriteOutcome};
pub use error::{StoreError, StoreResult};
pub use materialize::{EntitySource, Materialized};
pub use normalize::{Normalized, normalize, normalize_root};
pub use overlay::{OptimisticLayer, OptimisticRecipe, OverlayEntry, OverlayLayer, ReconcileFn};
pub use query_cache::{QueryCache, QueryRoot};
pub use txn::{CacheTxn, TxnTarget};
