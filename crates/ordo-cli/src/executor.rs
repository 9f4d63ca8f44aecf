//! Simulated work for the CLI: each task sleeps for its configured duration
//! and fails a fixed number of times before it succeeds.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use ordo_core::domain::{Task, TaskExecutionError};
use ordo_core::ports::TaskExecutor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Behaviour {
    pub duration: Duration,
    pub fail_times: u32,
}

/// Behaviour is looked up by task title; unknown titles succeed at once.
#[derive(Debug, Default)]
pub struct SimulatedExecutor {
    behaviours: HashMap<String, Behaviour>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl SimulatedExecutor {
    pub fn new(behaviours: HashMap<String, Behaviour>) -> Self {
        Self {
            behaviours,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Attempts made so far for `title`.
    pub fn attempts(&self, title: &str) -> u32 {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.get(title).copied().unwrap_or(0)
    }

    fn next_attempt(&self, title: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let n = attempts.entry(title.to_string()).or_insert(0);
        *n += 1;
        *n
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, TaskExecutionError> {
        let behaviour = self.behaviours.get(&task.title).copied().unwrap_or_default();
        let attempt = self.next_attempt(&task.title);
        tracing::info!(task = %task.title, attempt, "executing");

        if !behaviour.duration.is_zero() {
            tokio::time::sleep(behaviour.duration).await;
        }
        if attempt <= behaviour.fail_times {
            return Err(TaskExecutionError::failed(format!(
                "simulated failure {attempt} of {}",
                behaviour.fail_times
            )));
        }
        Ok(json!({ "task": task.title, "attempt": attempt }))
    }
}
