//! Error types for the cache layer.

use optistack_types::{EntityKey, MutationId};
use thiserror::Error;

/// Result type for cache operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in cache operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Materialization needed data the cache does not hold.
    #[error("cache miss at {path}")]
    CacheMiss { path: String },

    /// Entity not found.
    #[error("entity not found: {0}")]
    NotFound(EntityKey),

    /// Payload does not have the expected shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A reconciliation function reported a failure of its own.
    #[error("reconciliation failed: {0}")]
    Reconcile(String),

    /// No optimistic layer exists for this mutation.
    #[error("unknown optimistic layer: {0}")]
    UnknownLayer(MutationId),
}

impl StoreError {
    /// Whether this error only signals incomplete cached data.
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Self::CacheMiss { .. } | Self::NotFound(_))
    }
}
