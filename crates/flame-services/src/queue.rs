//! Pending transfer queue — priority ordered, stable among equal priorities.

use std::collections::{HashSet, VecDeque};

use tokio::sync::oneshot;
use tokio::time::Instant;

use flame_core::{TransferError, TransferRequest};

/// Sending half of a request's completion signal.
pub type CompletionSender = oneshot::Sender<Result<(), TransferError>>;

/// A request waiting for dispatch, together with its completion signal.
#[derive(Debug)]
pub struct QueuedTransfer {
    pub request: TransferRequest,
    pub done: CompletionSender,
    pub enqueued_at: Instant,
}

impl QueuedTransfer {
    pub fn new(request: TransferRequest, done: CompletionSender) -> Self {
        Self {
            request,
            done,
            enqueued_at: Instant::now(),
        }
    }
}

/// Requests not yet dispatched, head first.
///
/// The head always has the lowest priority value. A new request is placed
/// after every queued request with the same or a lower priority value, so
/// equal priorities keep their arrival order. Request ids are unique while
/// queued.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<QueuedTransfer>,
    ids: HashSet<String>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the priority-ordered position. Rejects an id that is already queued.
    pub fn push(&mut self, entry: QueuedTransfer) -> Result<usize, TransferError> {
        if self.ids.contains(&entry.request.id) {
            return Err(TransferError::InvalidRequest(format!(
                "{}: already pending",
                entry.request.id
            )));
        }
        let priority = entry.request.priority;
        let pos = self
            .entries
            .partition_point(|queued| queued.request.priority <= priority);
        self.ids.insert(entry.request.id.clone());
        self.entries.insert(pos, entry);
        Ok(pos)
    }

    /// Remove and return the head.
    pub fn pop(&mut self) -> Option<QueuedTransfer> {
        let entry = self.entries.pop_front()?;
        self.ids.remove(&entry.request.id);
        Some(entry)
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued ids in dispatch order.
    #[cfg(test)]
    pub fn ids_in_order(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.request.id.clone()).collect()
    }
}
