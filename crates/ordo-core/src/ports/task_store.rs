//! TaskStore port: the source of truth for task records and dependency edges.
//!
//! Design:
//! - Every status change goes through `update` with the version the caller
//!   read; a stale version is a `Conflict`, never a silent overwrite.
//! - Dependency edges are stored as a forward map and a derived reverse
//!   index. `add_dependency` rejects an edge that would close a cycle
//!   before mutating anything.
//! - `create` returns only after the record is durable, so callers publish
//!   to the queue afterwards.

use std::collections::{BTreeSet, HashSet, VecDeque};

use async_trait::async_trait;

use crate::domain::{NewTask, StoreError, Task, TaskId};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, id: TaskId) -> Result<Task, StoreError>;

    /// Persist a new task (status Pending, version 0). All of its
    /// dependencies must already exist.
    async fn create(&self, new: NewTask) -> Result<Task, StoreError>;

    /// Conditional update keyed on `expected_version`.
    ///
    /// Returns the stored record with its bumped version. The
    /// `dependencies` field of `task` is ignored; edges change only through
    /// the dependency operations.
    async fn update(&self, task: Task, expected_version: u64) -> Result<Task, StoreError>;

    /// Remove a task and every edge touching it.
    async fn delete(&self, id: TaskId) -> Result<(), StoreError>;

    /// Snapshot of every task, in creation order.
    async fn list_all(&self) -> Result<Vec<Task>, StoreError>;

    async fn dependencies_of(&self, id: TaskId) -> Result<BTreeSet<TaskId>, StoreError>;

    async fn dependents_of(&self, id: TaskId) -> Result<BTreeSet<TaskId>, StoreError>;

    /// Add the edge `task -> depends_on`, rejecting it with
    /// `StoreError::Cycle` if it would make the graph cyclic.
    async fn add_dependency(&self, task: TaskId, depends_on: TaskId) -> Result<(), StoreError>;

    async fn remove_dependency(&self, task: TaskId, depends_on: TaskId)
    -> Result<(), StoreError>;

    /// Liveness check used by `health::check`.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Every task `id` transitively depends on, breadth-first.
    ///
    /// Each task is fetched once (a visited set keeps diamonds linear).
    /// Dependencies deleted in the meantime are skipped.
    async fn all_dependencies(&self, id: TaskId) -> Result<Vec<Task>, StoreError> {
        let mut visited: HashSet<TaskId> = HashSet::from([id]);
        let mut queue: VecDeque<TaskId> = self.dependencies_of(id).await?.into_iter().collect();
        let mut out = Vec::new();

        while let Some(dep) = queue.pop_front() {
            if !visited.insert(dep) {
                continue;
            }
            let task = match self.get(dep).await {
                Ok(task) => task,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            queue.extend(task.dependencies.iter().filter(|d| !visited.contains(d)));
            out.push(task);
        }
        Ok(out)
    }
}
