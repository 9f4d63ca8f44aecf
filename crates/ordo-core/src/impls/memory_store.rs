//! InMemoryTaskStore - 開発用・テスト用の正本
//!
//! # 実装詳細
//! - `HashMap<TaskId, Task>` + 作成順の `Vec<TaskId>`
//! - 依存関係は `DependencyGraph`（forward + reverse edges）で管理
//! - `update` は version による楽観ロック（stale な version は Conflict）
//! - fault injection: `set_available` / `fail_next_updates`

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::Span;

use crate::domain::{NewTask, StoreError, Task, TaskId};
use crate::graph::DependencyGraph;
use crate::ports::{Clock, IdGenerator, TaskStore, UlidGenerator};

struct StoreState {
    tasks: HashMap<TaskId, Task>,
    /// Creation order.
    order: Vec<TaskId>,
    graph: DependencyGraph,
    available: bool,
    failing_updates: usize,
}

impl StoreState {
    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("task store is offline".to_string()))
        }
    }

    /// Clone a record with its dependency set filled from the edge index.
    fn snapshot(&self, id: TaskId) -> Result<Task, StoreError> {
        let mut task = self
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;
        task.dependencies = self.graph.dependencies_of(id).into_iter().collect();
        Ok(task)
    }
}

pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    ids: Box<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    span: Span,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let ids = Box::new(UlidGenerator::new(Arc::clone(&clock)));
        Self::with_id_generator(clock, ids)
    }

    pub fn with_id_generator(clock: Arc<dyn Clock>, ids: Box<dyn IdGenerator>) -> Self {
        Self {
            state: Mutex::new(StoreState {
                tasks: HashMap::new(),
                order: Vec::new(),
                graph: DependencyGraph::new(),
                available: true,
                failing_updates: 0,
            }),
            ids,
            clock,
            span: tracing::info_span!("task_store", backend = "memory"),
        }
    }

    /// Take the store offline (every call fails with `Unavailable`) or
    /// bring it back.
    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.available = available;
    }

    /// Make the next `n` calls to `update` fail with `Unavailable`.
    pub async fn fail_next_updates(&self, n: usize) {
        self.state.lock().await.failing_updates = n;
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        let state = self.state.lock().await;
        state.ensure_available()?;
        state.snapshot(id)
    }

    async fn create(&self, new: NewTask) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;

        if let Some(missing) = new
            .dependencies
            .iter()
            .find(|dep| !state.tasks.contains_key(*dep))
        {
            return Err(StoreError::UnknownDependency(*missing));
        }

        let id = self.ids.generate_task_id();
        let task = new.into_task(id, self.clock.now());

        state.graph.add_node(id);
        for dep in &task.dependencies {
            state.graph.add_dependency(id, *dep);
        }
        state.order.push(id);
        state.tasks.insert(id, task);

        tracing::debug!(parent: &self.span, task_id = %id, "task created");
        state.snapshot(id)
    }

    async fn update(&self, mut task: Task, expected_version: u64) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;

        if state.failing_updates > 0 {
            state.failing_updates -= 1;
            return Err(StoreError::Unavailable("injected update failure".to_string()));
        }

        let id = task.id;
        let current = state.tasks.get(&id).ok_or(StoreError::NotFound(id))?;
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                id,
                expected: expected_version,
                actual: current.version,
            });
        }

        task.version = expected_version + 1;
        task.created_at = current.created_at;
        task.dependencies = BTreeSet::new();
        state.tasks.insert(id, task);
        state.snapshot(id)
    }

    async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;

        if state.tasks.remove(&id).is_none() {
            return Err(StoreError::NotFound(id));
        }
        state.order.retain(|t| *t != id);
        state.graph.remove_node(id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        state.ensure_available()?;
        state.order.iter().map(|id| state.snapshot(*id)).collect()
    }

    async fn dependencies_of(&self, id: TaskId) -> Result<BTreeSet<TaskId>, StoreError> {
        let state = self.state.lock().await;
        state.ensure_available()?;
        if !state.tasks.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(state.graph.dependencies_of(id).into_iter().collect())
    }

    async fn dependents_of(&self, id: TaskId) -> Result<BTreeSet<TaskId>, StoreError> {
        let state = self.state.lock().await;
        state.ensure_available()?;
        if !state.tasks.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(state.graph.dependents_of(id).into_iter().collect())
    }

    async fn add_dependency(&self, task: TaskId, depends_on: TaskId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;

        if !state.tasks.contains_key(&task) {
            return Err(StoreError::NotFound(task));
        }
        if !state.tasks.contains_key(&depends_on) {
            return Err(StoreError::UnknownDependency(depends_on));
        }
        // checked under the same lock as the mutation
        if let Some(cycle) = state.graph.would_create_cycle(task, depends_on) {
            return Err(crate::domain::CyclicDependencyError { cycle }.into());
        }

        state.graph.add_dependency(task, depends_on);
        Ok(())
    }

    async fn remove_dependency(
        &self,
        task: TaskId,
        depends_on: TaskId,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;
        if !state.tasks.contains_key(&task) {
            return Err(StoreError::NotFound(task));
        }
        state.graph.remove_dependency(task, depends_on);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.state.lock().await.ensure_available()
    }
}
