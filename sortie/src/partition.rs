//! Positional partitioning of work items across workers.

use serde::{Deserialize, Serialize};

/// One unit of work: who acts, what they submit, and where.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Name of the identity record that performs the action.
    pub identity: String,
    /// Content submitted on the identity's behalf.
    pub payload: String,
    /// Resource the action is performed against.
    pub target: String,
}

impl WorkItem {
    pub fn new(
        identity: impl Into<String>,
        payload: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            payload: payload.into(),
            target: target.into(),
        }
    }
}

/// A contiguous slice of the input assigned to exactly one worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch<T> {
    /// Zero-based worker index; also the batch's position in the output.
    pub worker_index: usize,
    /// Offset of the first item within the original list.
    pub offset: usize,
    pub items: Vec<T>,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Split `items` into at most `worker_count` contiguous, non-empty batches.
///
/// The base size is `max(1, len / worker_count)`. Items are sliced in order
/// into chunks of that size; the remainder joins the last batch so that the
/// batch count never exceeds `worker_count`. With fewer items than workers,
/// each item gets its own batch. A `worker_count` of zero is treated as one.
pub fn divide<T>(items: Vec<T>, worker_count: usize) -> Vec<Batch<T>> {
    let len = items.len();
    if len == 0 {
        return Vec::new();
    }

    let workers = worker_count.max(1);
    let base = (len / workers).max(1);
    let batch_count = workers.min(len);

    let mut batches = Vec::with_capacity(batch_count);
    let mut rest = items.into_iter();
    for worker_index in 0..batch_count {
        let take = if worker_index + 1 == batch_count {
            len - base * worker_index
        } else {
            base
        };
        batches.push(Batch {
            worker_index,
            offset: base * worker_index,
            items: rest.by_ref().take(take).collect(),
        });
    }
    batches
}
