//! Mutation declarations and the per-client mutation log.

use optistack_store::{CacheTxn, ReconcileFn, StoreResult};
use optistack_types::MutationId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// A statically declared mutation: its name, variables and result shape.
///
/// The optimistic payload is a value of [`Mutation::Output`], so a guess that
/// does not match the expected result shape cannot be constructed.
pub trait Mutation {
    /// Operation name sent to the transport.
    const NAME: &'static str;

    type Variables: Serialize + Send + Sync;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Checks variables before anything is written or sent.
    fn validate(_variables: &Self::Variables) -> Result<(), String> {
        Ok(())
    }
}

/// One invocation of mutation `M`.
pub struct MutationRequest<M: Mutation> {
    pub variables: M::Variables,
    pub optimistic: Option<M::Output>,
    pub reconcile: Option<ReconcileFn>,
}

impl<M: Mutation> MutationRequest<M> {
    pub fn new(variables: M::Variables) -> Self {
        Self {
            variables,
            optimistic: None,
            reconcile: None,
        }
    }

    /// Result shown to observers until the server answers.
    #[must_use]
    pub fn optimistic(mut self, output: M::Output) -> Self {
        self.optimistic = Some(output);
        self
    }

    /// Adjusts derived collections. Runs against the optimistic layer while
    /// the mutation is pending and against the canonical store once it
    /// commits; never on rejection.
    #[must_use]
    pub fn reconcile<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CacheTxn<'_>, &Value) -> StoreResult<()> + Send + Sync + 'static,
    {
        self.reconcile = Some(Arc::new(f));
        self
    }
}

impl<M: Mutation> fmt::Debug for MutationRequest<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationRequest")
            .field("name", &M::NAME)
            .field("optimistic", &self.optimistic.is_some())
            .field("reconcile", &self.reconcile.is_some())
            .finish()
    }
}

/// Result of a committed mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult<T> {
    pub id: MutationId,
    pub data: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Committed,
    Rejected,
}

impl MutationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One in-flight or completed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: MutationId,
    pub name: String,
    pub variables: Value,
    pub optimistic: Option<Value>,
    pub status: MutationStatus,
    /// Failure reported to the caller, or a failed optimistic
    /// reconciliation. A committed mutation can carry one when either of
    /// its reconciliations failed.
    pub error: Option<String>,
}

impl MutationRecord {
    pub fn pending(id: MutationId, name: &str, variables: Value, optimistic: Option<Value>) -> Self {
        Self {
            id,
            name: name.to_string(),
            variables,
            optimistic,
            status: MutationStatus::Pending,
            error: None,
        }
    }
}

/// Pending records plus a bounded history of completed ones.
#[derive(Debug, Default)]
pub(crate) struct MutationLog {
    pending: BTreeMap<MutationId, MutationRecord>,
    history: VecDeque<MutationRecord>,
    capacity: usize,
}

impl MutationLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub(crate) fn begin(&mut self, record: MutationRecord) {
        self.pending.insert(record.id, record);
    }

    pub(crate) fn finish(&mut self, id: MutationId, status: MutationStatus, error: Option<String>) {
        let Some(mut record) = self.pending.remove(&id) else {
            return;
        };
        record.status = status;
        record.error = error.or(record.error);
        if self.capacity == 0 {
            return;
        }
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    pub(crate) fn get(&self, id: MutationId) -> Option<&MutationRecord> {
        self.pending
            .get(&id)
            .or_else(|| self.history.iter().rev().find(|r| r.id == id))
    }

    pub(crate) fn pending(&self) -> Vec<MutationRecord> {
        self.pending.values().cloned().collect()
    }

    pub(crate) fn history(&self) -> Vec<MutationRecord> {
        self.history.iter().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.history.clear();
    }
}
