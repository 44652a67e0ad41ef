//! Transport layer abstraction.
//!
//! The client only needs one round trip: send an operation, get back a
//! response or an error. Timeouts are applied by the client around
//! [`Transport::send`].

use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of operation sent to the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
}

/// A named operation and its variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub kind: OperationKind,
    pub variables: Value,
}

impl Operation {
    pub fn query(name: impl Into<String>, variables: Value) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::Query,
            variables,
        }
    }

    pub fn mutation(name: impl Into<String>, variables: Value) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::Mutation,
            variables,
        }
    }
}

/// One entry of a response's `errors` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: Vec::new(),
        }
    }
}

impl fmt::Display for GraphQLError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} (at {})", self.message, self.path.join("."))
        }
    }
}

/// A reply from the remote service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl Response {
    /// A successful response.
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// A response carrying a single error and no data.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: None,
            errors: vec![GraphQLError::new(message)],
        }
    }

    /// Returns the data, treating any GraphQL error as a rejection.
    pub fn into_data(self) -> ClientResult<Value> {
        if !self.errors.is_empty() {
            let messages: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
            return Err(ClientError::Server(messages.join("; ")));
        }
        match self.data {
            Some(data) if data.is_object() => Ok(data),
            Some(other) => Err(ClientError::InvalidResponse(format!(
                "expected object data, got {other}"
            ))),
            None => Err(ClientError::InvalidResponse("response carried no data".into())),
        }
    }
}

/// Sends operations to the remote service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `operation` and waits for the reply.
    async fn send(&self, operation: Operation) -> ClientResult<Response>;
}

/// A scripted transport for testing.
pub mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    enum Scripted {
        Reply(Response),
        Fail(String),
        Hang,
        Deferred {
            requested: oneshot::Sender<Operation>,
            reply: oneshot::Receiver<ClientResult<Response>>,
        },
    }

    /// A reply the test resolves by hand, after observing the request.
    #[derive(Debug)]
    pub struct DeferredReply {
        requested: Option<oneshot::Receiver<Operation>>,
        reply: oneshot::Sender<ClientResult<Response>>,
    }

    impl DeferredReply {
        /// Waits until the operation has been sent. Returns `None` if the
        /// transport was dropped first or this was already awaited.
        pub async fn requested(&mut self) -> Option<Operation> {
            self.requested.take()?.await.ok()
        }

        /// Completes the request with `data`.
        pub fn resolve(self, data: Value) {
            self.respond(Response::data(data));
        }

        pub fn respond(self, response: Response) {
            let _ = self.reply.send(Ok(response));
        }

        /// Fails the request with a network error.
        pub fn reject(self, message: impl Into<String>) {
            let _ = self.reply.send(Err(ClientError::Network(message.into())));
        }
    }

    /// Replies are scripted per operation name and consumed in order.
    /// Operations without a scripted reply fail with a network error.
    #[derive(Default)]
    pub struct MockTransport {
        script: Mutex<HashMap<String, VecDeque<Scripted>>>,
        sent: Mutex<Vec<Operation>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        fn push(&self, name: &str, scripted: Scripted) {
            self.script
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .push_back(scripted);
        }

        /// Answers the next `name` operation with `data`.
        pub fn reply(&self, name: &str, data: Value) {
            self.push(name, Scripted::Reply(Response::data(data)));
        }

        /// Answers the next `name` operation with an arbitrary response.
        pub fn respond(&self, name: &str, response: Response) {
            self.push(name, Scripted::Reply(response));
        }

        /// Fails the next `name` operation with a network error.
        pub fn fail(&self, name: &str, message: impl Into<String>) {
            self.push(name, Scripted::Fail(message.into()));
        }

        /// Never answers the next `name` operation.
        pub fn hang(&self, name: &str) {
            self.push(name, Scripted::Hang);
        }

        /// Holds the next `name` operation until the returned handle is
        /// resolved or rejected.
        pub fn defer(&self, name: &str) -> DeferredReply {
            let (requested_tx, requested_rx) = oneshot::channel();
            let (reply_tx, reply_rx) = oneshot::channel();
            self.push(
                name,
                Scripted::Deferred {
                    requested: requested_tx,
                    reply: reply_rx,
                },
            );
            DeferredReply {
                requested: Some(requested_rx),
                reply: reply_tx,
            }
        }

        /// Every operation sent so far.
        pub fn sent(&self) -> Vec<Operation> {
            self.sent.lock().unwrap().clone()
        }

        /// How many `name` operations were sent.
        pub fn sent_count(&self, name: &str) -> usize {
            self.sent.lock().unwrap().iter().filter(|op| op.name == name).count()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, operation: Operation) -> ClientResult<Response> {
            self.sent.lock().unwrap().push(operation.clone());
            let next = self
                .script
                .lock()
                .unwrap()
                .get_mut(&operation.name)
                .and_then(VecDeque::pop_front);

            match next {
                Some(Scripted::Reply(response)) => Ok(response),
                Some(Scripted::Fail(message)) => Err(ClientError::Network(message)),
                Some(Scripted::Hang) => std::future::pending().await,
                Some(Scripted::Deferred { requested, reply }) => {
                    let _ = requested.send(operation);
                    reply
                        .await
                        .unwrap_or_else(|_| Err(ClientError::Network("deferred reply dropped".into())))
                }
                None => Err(ClientError::Network(format!(
                    "no reply scripted for {}",
                    operation.name
                ))),
            }
        }
    }
}
