//! TaskExecutor port: the pluggable task body.

use async_trait::async_trait;

use crate::domain::{Task, TaskExecutionError};

/// Runs the body of a task.
///
/// The worker treats it as opaque: `Ok(value)` becomes the task result,
/// any `Err` drives the retry path. Implementations may take arbitrary time.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, TaskExecutionError>;
}
