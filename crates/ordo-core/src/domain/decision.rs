//! Decision model: what happens to a delivery after the gates and the task body.
//!
//! Deciders are pure: given the task snapshot and what was observed, they
//! return the next action. Applying it (store writes, ack/reject, publish) is
//! the worker's job.

use chrono::{DateTime, Utc};

use super::errors::TaskExecutionError;
use super::ids::TaskId;
use super::task::Task;

/// Outcome of the readiness and dependency gates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// Execute now.
    Open,

    /// `scheduled_at` is still in the future.
    NotReady { scheduled_at: DateTime<Utc> },

    /// Some transitive dependencies are not Completed yet.
    DependenciesPending { pending: Vec<TaskId> },
}

impl Gate {
    pub fn is_open(&self) -> bool {
        matches!(self, Gate::Open)
    }
}

/// Next action after a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Count the failure and hand the message back to the queue.
    Retry { retry_count: u32 },

    /// Give up; the task becomes Failed.
    MarkFailed { reason: String },
}

pub trait Decider: Send + Sync {
    fn on_failure(&self, task: &Task, error: &TaskExecutionError) -> Decision;
}

/// Bounded retry on `max_retries`.
///
/// A task with `max_retries = n` is requeued after each of its first `n`
/// failures and marked Failed on failure `n + 1`, ending with
/// `retry_count == max_retries`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecider;

impl Decider for DefaultDecider {
    fn on_failure(&self, task: &Task, error: &TaskExecutionError) -> Decision {
        if task.retry_count < task.max_retries {
            Decision::Retry {
                retry_count: task.retry_count + 1,
            }
        } else {
            Decision::MarkFailed {
                reason: format!(
                    "retries exhausted ({}/{}): {error}",
                    task.retry_count, task.max_retries
                ),
            }
        }
    }
}
