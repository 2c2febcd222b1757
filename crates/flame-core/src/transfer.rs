//! Transfer request types shared between the engine and its callers.

use serde::{Deserialize, Serialize};

/// GPU / node identifier.
pub type NodeId = u32;

/// Dispatch priority. Lower values dispatch first.
pub type Priority = i32;

/// Requests at or above this tier (numerically `<=`) get the fast path.
pub const HIGHEST_PRIORITY: Priority = 0;

/// Latency is charged per started mebibyte.
pub const MIB: u64 = 1 << 20;

/// A prioritized fragment transfer between two nodes.
///
/// The completion signal is not part of the request: the engine creates it
/// at submission and hands the receiving half back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: String,
    pub src_node: NodeId,
    pub dst_node: NodeId,
    pub size_bytes: u64,
    pub priority: Priority,
    /// Free-form metadata, typically the fragment key being moved.
    #[serde(default)]
    pub meta: String,
}

impl TransferRequest {
    pub fn new(id: impl Into<String>, src_node: NodeId, dst_node: NodeId) -> Self {
        Self {
            id: id.into(),
            src_node,
            dst_node,
            size_bytes: 0,
            priority: 0,
            meta: String::new(),
        }
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_meta(mut self, meta: impl Into<String>) -> Self {
        self.meta = meta.into();
        self
    }

    /// Structural checks done before a request may enter the pending queue.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.id.trim().is_empty() {
            return Err(TransferError::InvalidRequest("empty request id".into()));
        }
        if self.src_node == self.dst_node {
            return Err(TransferError::InvalidRequest(format!(
                "{}: source and destination are both node {}",
                self.id, self.src_node
            )));
        }
        Ok(())
    }

    pub fn is_high_priority(&self) -> bool {
        self.priority <= HIGHEST_PRIORITY
    }

    /// Number of started MiB in the payload (`ceil(size / 1 MiB)`).
    pub fn size_mib(&self) -> u64 {
        self.size_bytes.div_ceil(MIB)
    }
}

/// Outcome of a transfer as seen by the submitting caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("invalid transfer request: {0}")]
    InvalidRequest(String),
    #[error("wait canceled by caller")]
    Canceled,
    #[error("wait deadline exceeded")]
    DeadlineExceeded,
    /// The engine was dropped while the request was still queued.
    #[error("transfer abandoned by engine")]
    Abandoned,
}
