//! TaskService - API 層から呼ばれる操作
//!
//! Create is two-phase: the store confirms the durable write first, only
//! then is the task handed to the queue. Dependency changes are validated
//! (cycle check included) before anything is mutated.

use std::sync::Arc;

use thiserror::Error;
use tracing::Span;

use crate::domain::{CyclicDependencyError, NewTask, QueueError, StoreError, Task, TaskId};
use crate::graph;
use crate::observability::StatusCounts;
use crate::ports::{Clock, TaskStore};
use crate::queue::TaskQueue;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Cycle(#[from] CyclicDependencyError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Cycle(cycle) => ServiceError::Cycle(cycle),
            other => ServiceError::Store(other),
        }
    }
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    queue: Arc<TaskQueue>,
    clock: Arc<dyn Clock>,
    span: Span,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>, queue: Arc<TaskQueue>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            queue,
            clock,
            span: tracing::info_span!("task_service"),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Persist a new task, then submit it (with its pending dependencies).
    pub async fn create_task(&self, new: NewTask) -> Result<Task, ServiceError> {
        let task = self.store.create(new).await?;
        tracing::info!(parent: &self.span, task_id = %task.id, title = %task.title, "task created");
        self.submit(task.id).await
    }

    /// Create several tasks without submitting them. Dependencies may only
    /// point at tasks created earlier (in this batch or before).
    pub async fn create_all(&self, tasks: Vec<NewTask>) -> Result<Vec<Task>, ServiceError> {
        let mut created = Vec::with_capacity(tasks.len());
        for new in tasks {
            created.push(self.store.create(new).await?);
        }
        Ok(created)
    }

    /// Hand an existing task to the queue.
    pub async fn submit(&self, id: TaskId) -> Result<Task, ServiceError> {
        let task = self.store.get(id).await?;
        self.queue
            .submit_task(&task, self.store.as_ref(), self.clock.as_ref())
            .await?;
        Ok(self.store.get(id).await?)
    }

    pub async fn get(&self, id: TaskId) -> Result<Task, ServiceError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn delete(&self, id: TaskId) -> Result<(), ServiceError> {
        self.store.delete(id).await?;
        tracing::info!(parent: &self.span, task_id = %id, "task deleted");
        Ok(())
    }

    /// Add `task -> depends_on`; rejected with the cycle it would close.
    pub async fn add_dependency(&self, task: TaskId, depends_on: TaskId) -> Result<(), ServiceError> {
        self.store.add_dependency(task, depends_on).await?;
        tracing::info!(parent: &self.span, task_id = %task, depends_on = %depends_on, "dependency added");
        Ok(())
    }

    pub async fn remove_dependency(
        &self,
        task: TaskId,
        depends_on: TaskId,
    ) -> Result<(), ServiceError> {
        self.store.remove_dependency(task, depends_on).await?;
        Ok(())
    }

    /// Direct dependencies of `id`.
    pub async fn dependencies(&self, id: TaskId) -> Result<Vec<Task>, ServiceError> {
        let ids = self.store.dependencies_of(id).await?;
        self.load(ids).await
    }

    /// Tasks that directly depend on `id`.
    pub async fn dependents(&self, id: TaskId) -> Result<Vec<Task>, ServiceError> {
        let ids = self.store.dependents_of(id).await?;
        self.load(ids).await
    }

    async fn load(&self, ids: impl IntoIterator<Item = TaskId>) -> Result<Vec<Task>, ServiceError> {
        let mut tasks = Vec::new();
        for id in ids {
            tasks.push(self.store.get(id).await?);
        }
        Ok(tasks)
    }

    /// Every task, dependencies first. A cycle is reported, never a
    /// partial order.
    pub async fn execution_order(&self) -> Result<Vec<Task>, ServiceError> {
        let tasks = self.store.list_all().await?;
        Ok(graph::resolve(tasks)?)
    }

    pub async fn status_counts(&self) -> Result<StatusCounts, ServiceError> {
        let tasks = self.store.list_all().await?;
        Ok(StatusCounts::from_tasks(&tasks))
    }
}
