//! Transaction options and batch results.

use serde::{Deserialize, Serialize};

/// Transaction isolation level requested from the storage collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
}

/// Options forwarded verbatim when a layer opens a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOptions {
    /// Requested isolation level
    #[serde(default)]
    pub isolation_level: Option<IsolationLevel>,

    /// Maximum time to wait for the transaction to start, in milliseconds
    #[serde(default)]
    pub max_wait_ms: Option<u64>,

    /// Maximum time the transaction may run, in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Result of a batch mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPayload {
    /// Number of affected rows
    pub count: u64,
}

impl BatchPayload {
    pub fn new(count: u64) -> Self {
        Self { count }
    }
}
