//! Optimistic mutation executor and observer notification bus for optistack.
//!
//! # Architecture
//!
//! - **Transport**: sends a named operation and returns the reply
//! - **Bus**: fans cache changes out to query and fragment observers
//! - **Mutation**: statically typed mutation declarations and their records
//! - **Client**: owns the normalized cache and drives the mutation lifecycle
//!
//! ## Mutation lifecycle
//!
//! 1. **Validate**: variables are checked before anything is written
//! 2. **Pending**: the optimistic payload (if any) is written to its own
//!    overlay layer and observers are notified
//! 3. **Dispatch**: the operation is sent through the transport
//! 4. **Commit**: the layer is dropped, the server payload is written
//!    canonically, the reconciliation function runs and observers are
//!    notified once
//! 5. **Reject**: the layer is dropped, nothing else is written and the
//!    error is returned
//!
//! # Example
//!
//! ```
//! use optistack_client::transport::mock::MockTransport;
//! use optistack_client::{Client, ClientConfig};
//! use optistack_model::{EntitySchema, SchemaRegistry};
//! use std::sync::Arc;
//!
//! let schema = SchemaRegistry::new().with(EntitySchema::new("Pet"));
//! let config = ClientConfig {
//!     name: "pets".to_string(),
//!     ..Default::default()
//! };
//!
//! let client = Client::new(schema, Arc::new(MockTransport::new()), config);
//! ```

mod bus;
mod client;
mod error;
mod mutation;
pub mod transport;

pub use bus::{Notification, NotificationBus, QueryState, Subscription, Watch};
pub use client::{Client, ClientConfig, FetchPolicy};
pub use error::{ClientError, ClientResult};
pub use mutation::{Mutation, MutationRecord, MutationRequest, MutationResult, MutationStatus};
pub use transport::{GraphQLError, Operation, OperationKind, Response, Transport};
