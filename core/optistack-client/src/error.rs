//! Error types for the client layer.

use optistack_store::StoreError;
use optistack_types::MutationId;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced to callers of the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport failed to deliver the operation or its reply.
    #[error("network error: {0}")]
    Network(String),

    /// No reply arrived within the configured deadline.
    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    /// Malformed variables or optimistic payload; nothing was sent.
    #[error("validation error: {0}")]
    Validation(String),

    /// The server accepted the mutation but the caller's reconciliation
    /// failed. The canonical write is kept.
    #[error("reconciliation of {mutation} failed: {source}")]
    Reconciliation {
        mutation: MutationId,
        #[source]
        source: StoreError,
    },

    /// The server answered with GraphQL errors.
    #[error("server error: {0}")]
    Server(String),

    /// The reply could not be interpreted.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Cache error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The client was disposed.
    #[error("client disposed")]
    Disposed,

    /// A background mutation task panicked or was cancelled.
    #[error("mutation task failed: {0}")]
    TaskFailed(String),
}

impl ClientError {
    /// Transport failures and timeouts.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    /// Whether the error means the mutation never reached the canonical store.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::Server(_) | Self::InvalidResponse(_)
        )
    }
}
