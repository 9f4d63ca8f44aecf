//! The `ordo` subcommands, wired on the in-memory broker and store.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use ordo_core::app::{HealthReport, ServiceError, TaskService, Worker, WorkerGroup, health};
use ordo_core::config::OrdoConfig;
use ordo_core::domain::{NewTask, Priority, Task, TaskId, TaskStatus};
use ordo_core::impls::{InMemoryBroker, InMemoryTaskStore};
use ordo_core::observability::StatusCounts;
use ordo_core::ports::{Clock, SystemClock, TaskExecutor, TaskStore};
use ordo_core::queue::TaskQueue;

use crate::cli::SubmitArgs;
use crate::executor::{Behaviour, SimulatedExecutor};
use crate::tasks_file::{Installed, TasksFile};

const POLL: Duration = Duration::from_millis(50);

/// Broker, store and service for one command invocation.
pub struct Engine {
    config: OrdoConfig,
    broker: InMemoryBroker,
    store: Arc<InMemoryTaskStore>,
    clock: Arc<SystemClock>,
    queue: Arc<TaskQueue>,
    service: TaskService,
}

impl Engine {
    pub fn new(config: OrdoConfig) -> Self {
        let broker = InMemoryBroker::new();
        let clock = Arc::new(SystemClock);
        let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
        let queue = Arc::new(TaskQueue::new(broker.connection(), config.queue_settings()));
        let service = TaskService::new(store.clone(), queue.clone(), clock.clone());
        Self {
            config,
            broker,
            store,
            clock,
            queue,
            service,
        }
    }

    pub fn service(&self) -> &TaskService {
        &self.service
    }

    /// `count` workers, each on its own connection.
    pub fn spawn_workers(&self, count: usize, executor: Arc<dyn TaskExecutor>) -> WorkerGroup {
        let settings = self.config.worker_settings();
        let workers = (0..count)
            .map(|id| {
                Worker::new(
                    id,
                    TaskQueue::new(self.broker.connection(), self.config.queue_settings()),
                    self.store.clone(),
                    executor.clone(),
                    self.clock.clone(),
                    settings.clone(),
                )
            })
            .collect();
        WorkerGroup::spawn(workers)
    }

    async fn install(&self, tasks: &TasksFile) -> Result<Installed> {
        let default_max_retries = self.config.tasks.default_max_retries;
        match tasks
            .install(&self.service, default_max_retries, self.clock.now())
            .await
        {
            Ok(installed) => Ok(installed),
            Err((installed, ServiceError::Cycle(cycle))) => Err(anyhow!(
                "dependency cycle: {}",
                installed.describe_cycle(&cycle.cycle)
            )),
            Err((_, err)) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub name: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub last_run_at: Option<chrono::DateTime<chrono::Utc>>,
    pub scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Every task settled (interrupted or timed out otherwise).
    pub finished: bool,
    pub counts: StatusCounts,
    pub tasks: Vec<TaskSummary>,
}

impl RunReport {
    pub fn print(&self) {
        println!(
            "{:<20} {:<12} {:>7}  {}",
            "TASK", "STATUS", "RETRIES", "RESULT"
        );
        for task in &self.tasks {
            let result = task
                .result
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<20} {:<12} {:>7}  {}",
                task.name, task.status, task.retry_count, result
            );
        }
        let c = &self.counts;
        println!(
            "\n{} tasks: {} completed, {} failed, {} queued, {} in progress, {} pending",
            c.total(),
            c.completed,
            c.failed,
            c.queued,
            c.in_progress,
            c.pending
        );
        if !self.finished {
            println!("stopped before every task settled");
        }
    }
}

/// `ordo run`: load, submit, work until every task has settled.
pub async fn run_tasks(
    config: OrdoConfig,
    tasks: &TasksFile,
    workers: usize,
    timeout: Option<Duration>,
) -> Result<RunReport> {
    let engine = Engine::new(config);
    let installed = engine.install(tasks).await?;
    let executor = Arc::new(SimulatedExecutor::new(tasks.behaviours()));
    let group = engine.spawn_workers(workers, executor);
    info!(tasks = installed.ids.len(), workers, "submitting tasks");

    // Submitting the tasks nothing depends on pulls in everything else.
    for (name, id) in &installed.ids {
        if engine.service.dependents(*id).await?.is_empty() {
            info!(task = %name, "submit");
            engine.service.submit(*id).await?;
        }
    }

    let ids: Vec<TaskId> = installed.ids.values().copied().collect();
    let store = engine.store.as_ref();
    let pending = ids.as_slice();
    let finished = wait_for(timeout, move || settled(store, pending)).await?;
    group.shutdown_and_join().await;

    let mut summaries = Vec::with_capacity(ids.len());
    for (name, id) in &installed.ids {
        let task = store.get(*id).await?;
        summaries.push(TaskSummary {
            name: name.clone(),
            status: task.status,
            retry_count: task.retry_count,
            last_run_at: task.last_run_at,
            scheduled_at: task.scheduled_at,
            result: task.result,
        });
    }
    Ok(RunReport {
        finished,
        counts: engine.service.status_counts().await?,
        tasks: summaries,
    })
}

/// A task has settled when it reached a terminal status (a recurring task
/// stays Completed between runs), or when a dependency failed and it can
/// never run.
async fn settled(store: &dyn TaskStore, ids: &[TaskId]) -> Result<bool> {
    for id in ids {
        let task = store.get(*id).await?;
        if task.status.is_terminal() {
            continue;
        }
        let blocked = store
            .all_dependencies(*id)
            .await?
            .iter()
            .any(|dep| dep.status == TaskStatus::Failed);
        if !blocked {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Poll `done` until it holds, the timeout passes or Ctrl-C arrives.
/// Returns whether `done` was reached.
async fn wait_for<F, Fut>(timeout: Option<Duration>, mut done: F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = timeout.map(|t| Instant::now() + t);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if done().await? {
            return Ok(true);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            warn!("timed out waiting for tasks to settle");
            return Ok(false);
        }
        tokio::select! {
            res = &mut ctrl_c => {
                if let Err(err) = res {
                    warn!(error = %err, "failed to listen for Ctrl+C");
                }
                info!("interrupted");
                return Ok(false);
            }
            _ = tokio::time::sleep(POLL) => {}
        }
    }
}

/// `ordo order`: task names in execution order.
pub async fn execution_order(config: OrdoConfig, tasks: &TasksFile) -> Result<Vec<String>> {
    let engine = Engine::new(config);
    let installed = engine.install(tasks).await?;
    let order = engine.service.execution_order().await?;
    Ok(order.iter().map(|task| installed.name(task.id)).collect())
}

/// `ordo submit`: one test task through a single worker.
pub async fn submit_test_task(config: OrdoConfig, args: &SubmitArgs) -> Result<Task> {
    let default_max_retries = config.tasks.default_max_retries;
    let engine = Engine::new(config);
    let executor = Arc::new(SimulatedExecutor::new(HashMap::from([(
        args.title.clone(),
        Behaviour {
            duration: Duration::ZERO,
            fail_times: args.fail_times,
        },
    )])));
    let group = engine.spawn_workers(1, executor);

    let new = NewTask::new(args.title.clone())
        .with_description("Test task submitted from the command line")
        .with_priority(Priority::try_from(args.priority)?)
        .with_max_retries(args.max_retries.unwrap_or(default_max_retries));
    let task = engine.service.create_task(new).await?;
    info!(task_id = %task.id, "test task submitted");

    let store = engine.store.as_ref();
    let ids = [task.id];
    let pending = ids.as_slice();
    wait_for(None, move || settled(store, pending)).await?;
    group.shutdown_and_join().await;

    Ok(store.get(task.id).await?)
}

/// `ordo health`.
pub async fn check_health(config: OrdoConfig) -> HealthReport {
    let engine = Engine::new(config);
    health::check(&engine.queue, engine.store.as_ref()).await
}
