//! Error taxonomy, one enum per seam.
//!
//! - `CyclicDependencyError`: a dependency change or ordering query hit a cycle.
//! - `StoreError`: the task store (not found, version conflict, backend).
//! - `TransportError`: the message broker connection.
//! - `QueueError`: what `TaskQueue` surfaces to producers and consumers.
//! - `TaskExecutionError`: the task body failed; drives retry, never escapes the worker.
//! - `WorkerError`: a delivery could not be settled (not acknowledged, will be redelivered).

use std::time::Duration;

use thiserror::Error;

use super::ids::TaskId;

/// A dependency cycle, as the ordered id sequence that closes on itself.
///
/// An empty `cycle` means a cycle exists but the path was not traced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cyclic dependency detected{}", describe_path(.cycle))]
pub struct CyclicDependencyError {
    pub cycle: Vec<TaskId>,
}

/// `: a -> b -> a`, or nothing for an untraced cycle.
fn describe_path(cycle: &[TaskId]) -> String {
    if cycle.is_empty() {
        return String::new();
    }
    let path: Vec<String> = cycle.iter().map(ToString::to_string).collect();
    format!(": {}", path.join(" -> "))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: TaskId,
        expected: u64,
        actual: u64,
    },

    #[error("unknown dependency: {0}")]
    UnknownDependency(TaskId),

    #[error(transparent)]
    Cycle(#[from] CyclicDependencyError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection is closed")]
    ConnectionClosed,

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("no queue named '{0}'")]
    UnknownQueue(String),

    #[error("queue '{0}' redeclared with different arguments")]
    PreconditionFailed(String),

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("transaction commit failed: {0}")]
    CommitFailed(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// Connecting (or reconnecting once) failed.
    #[error("task queue unavailable")]
    Unavailable(#[source] TransportError),

    /// The send failed; the channel transaction was rolled back.
    #[error("publish failed and was rolled back")]
    PublishFailed(#[source] TransportError),

    #[error("transport error")]
    Transport(#[from] TransportError),

    #[error("failed to encode task envelope")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskExecutionError {
    #[error("task execution failed: {0}")]
    Failed(String),

    #[error("task execution timed out after {0:?}")]
    TimedOut(Duration),
}

impl TaskExecutionError {
    pub fn failed(reason: impl Into<String>) -> Self {
        TaskExecutionError::Failed(reason.into())
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("persistence failed")]
    Persistence(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
