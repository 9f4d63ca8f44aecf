//! TaskEnvelope: the minimal message that travels through the queue.
//!
//! Shape on the wire:
//! `{"id": "<uuid>", "title": "...", "description": "...", "priority": 1..=3}`
//!
//! Delayed messages use the same envelope; the delay lives in the delay
//! queue's declaration, never in the payload.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ids::TaskId;
use super::task::{Priority, Task};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    id: Uuid,
    title: String,
    description: String,
    priority: Priority,
}

impl TaskEnvelope {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.as_uuid(),
            title: task.title.clone(),
            description: task.description.clone(),
            priority: task.priority,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn task_id(&self) -> TaskId {
        TaskId::from_uuid(self.id)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
