//! Core identifier types for optistack.
//!
//! This crate defines the small, dependency-light vocabulary shared by every
//! layer of the client data layer:
//! - Entity keys derived from a typename and a server-assigned id (`Pet:42`)
//! - Query keys (operation name plus canonicalized variables)
//! - Mutation sequence numbers
//! - Observer handles (UUID v7)

mod ids;

pub use ids::{EntityKey, MutationId, ObserverId, QueryKey};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid entity key: {0}")]
    InvalidEntityKey(String),
}
