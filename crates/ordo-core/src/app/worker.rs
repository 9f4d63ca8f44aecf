//! Worker - 配送された task を gate → execute → decide → settle する状態機械
//!
//! Per delivery:
//! 1. Load the task. Gone, or already Completed/Failed: ack and discard.
//!    A Completed recurring task whose next run is due goes on instead.
//! 2. InProgress (conditional update).
//! 3. Readiness gate, then dependency gate. A closed gate sets the task back
//!    to Queued, republishes it with `redelivery_delay` and acks.
//! 4. Execute (optionally bounded by `execution_timeout`).
//! 5. Success: Completed with result and `last_run_at`; a recurring task is
//!    rescheduled in the same update (staying Completed) and republished
//!    before the ack, straight to the live queue if the next run is
//!    already due.
//! 6. Failure: the `Decider` picks retry (Queued, reject with requeue) or
//!    give up (Failed, ack).
//!
//! Any store error (including a version conflict) leaves the delivery
//! unacknowledged and requeued: a duplicate delivery beats a lost status.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::Span;

use crate::domain::{
    Decider, Decision, DefaultDecider, Gate, StoreError, Task, TaskExecutionError, TaskId,
    TaskStatus, WorkerError,
};
use crate::ports::{Clock, TaskExecutor, TaskStore};
use crate::queue::{TaskDelivery, TaskQueue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Delay before a gated task is seen again.
    pub redelivery_delay: Duration,
    /// Upper bound on one execution; `None` waits forever.
    pub execution_timeout: Option<Duration>,
    /// Pause between attempts to reopen a lost connection.
    pub reconnect_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            redelivery_delay: Duration::from_secs(60),
            execution_timeout: None,
            reconnect_backoff: Duration::from_secs(1),
        }
    }
}

/// What became of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Task missing or already settled; the message was dropped.
    Discarded,
    /// A gate was closed; the task was republished with a delay.
    Deferred(Gate),
    /// Executed successfully. `next_run` is set for recurring tasks.
    Completed { next_run: Option<DateTime<Utc>> },
    /// Failed and handed back for another attempt.
    Retrying { retry_count: u32 },
    /// Failed with retries exhausted.
    Failed,
}

enum Settle {
    Ack,
    Requeue,
}

pub struct Worker {
    id: usize,
    queue: TaskQueue,
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn TaskExecutor>,
    clock: Arc<dyn Clock>,
    decider: Arc<dyn Decider>,
    settings: WorkerSettings,
    span: Span,
}

impl Worker {
    /// A worker owns its queue connection; run several workers for
    /// concurrency.
    pub fn new(
        id: usize,
        queue: TaskQueue,
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn TaskExecutor>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id,
            queue,
            store,
            executor,
            clock,
            decider: Arc::new(DefaultDecider),
            settings,
            span: tracing::info_span!("worker", worker_id = id),
        }
    }

    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Consume until `shutdown` flips to true (or its sender is dropped).
    ///
    /// A lost connection is reopened after `reconnect_backoff`. In-flight
    /// executions are not cancelled; shutdown only stops taking new
    /// deliveries.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(parent: &self.span, "worker started");

        'outer: loop {
            if *shutdown.borrow() {
                break;
            }

            let mut consumer = match self.queue.consume().await {
                Ok(consumer) => consumer,
                Err(err) => {
                    tracing::warn!(parent: &self.span, error = %err, "cannot consume, retrying");
                    tokio::select! {
                        _ = wait_for_shutdown(&mut shutdown) => break 'outer,
                        _ = tokio::time::sleep(self.settings.reconnect_backoff) => continue,
                    }
                }
            };

            loop {
                let delivery = tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => break 'outer,
                    delivery = consumer.next() => delivery,
                };
                let Some(delivery) = delivery else {
                    tracing::warn!(parent: &self.span, "connection lost");
                    break;
                };

                match self.process(delivery).await {
                    Ok(outcome) => tracing::debug!(parent: &self.span, ?outcome, "delivery settled"),
                    Err(err) => tracing::warn!(parent: &self.span, error = %err, "delivery not settled"),
                }
            }
        }

        if let Err(err) = self.queue.close().await {
            tracing::warn!(parent: &self.span, error = %err, "close failed");
        }
        tracing::info!(parent: &self.span, "worker stopped");
    }

    /// Drive one delivery through the state machine and settle it.
    pub async fn process(&self, delivery: TaskDelivery) -> Result<ProcessOutcome, WorkerError> {
        let task_id = delivery.task_id();
        match self.handle(task_id).await {
            Ok((Settle::Ack, outcome)) => {
                delivery.ack().await?;
                Ok(outcome)
            }
            Ok((Settle::Requeue, outcome)) => {
                delivery.requeue().await?;
                Ok(outcome)
            }
            Err(err) => {
                tracing::warn!(
                    parent: &self.span,
                    task_id = %task_id,
                    error = %err,
                    "leaving delivery for redelivery"
                );
                if let Err(requeue) = delivery.requeue().await {
                    tracing::warn!(parent: &self.span, error = %requeue, "requeue failed");
                }
                Err(err)
            }
        }
    }

    async fn handle(&self, task_id: TaskId) -> Result<(Settle, ProcessOutcome), WorkerError> {
        let task = match self.store.get(task_id).await {
            Ok(task) => task,
            Err(StoreError::NotFound(_)) => {
                tracing::info!(parent: &self.span, task_id = %task_id, "task no longer exists, discarding");
                return Ok((Settle::Ack, ProcessOutcome::Discarded));
            }
            Err(err) => return Err(err.into()),
        };

        let now = self.clock.now();
        if task.status.is_terminal() && !task.is_due_again(now) {
            tracing::info!(
                parent: &self.span,
                task_id = %task_id,
                status = %task.status,
                "task already settled, discarding redelivery"
            );
            return Ok((Settle::Ack, ProcessOutcome::Discarded));
        }

        let task = self
            .save(task, |t| t.mark_in_progress(now))
            .await?;

        let gate = self.gate(&task, now).await?;
        if !gate.is_open() {
            let task = self.save(task, |t| t.mark_queued(now)).await?;
            self.queue
                .publish(&task, task.priority, self.settings.redelivery_delay)
                .await?;
            tracing::info!(parent: &self.span, task_id = %task_id, ?gate, "task deferred");
            return Ok((Settle::Ack, ProcessOutcome::Deferred(gate)));
        }

        let result = self.execute(&task).await;
        let now = self.clock.now();

        match result {
            Ok(value) => {
                let mut next_run = None;
                let task = self
                    .save(task, |t| {
                        t.mark_completed(value, now);
                        next_run = t.reschedule(now);
                    })
                    .await?;

                if let Some(next) = next_run {
                    let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
                    self.queue.publish(&task, task.priority, delay).await?;
                    tracing::info!(parent: &self.span, task_id = %task_id, next_run = %next, "task completed, rescheduled");
                } else {
                    tracing::info!(parent: &self.span, task_id = %task_id, "task completed");
                }
                Ok((Settle::Ack, ProcessOutcome::Completed { next_run }))
            }
            Err(err) => match self.decider.on_failure(&task, &err) {
                Decision::Retry { retry_count } => {
                    let task = self.save(task, |t| t.mark_retrying(now)).await?;
                    debug_assert_eq!(task.retry_count, retry_count);
                    tracing::warn!(
                        parent: &self.span,
                        task_id = %task_id,
                        retry_count,
                        max_retries = task.max_retries,
                        error = %err,
                        "task failed, requeued"
                    );
                    Ok((Settle::Requeue, ProcessOutcome::Retrying { retry_count }))
                }
                Decision::MarkFailed { reason } => {
                    self.save(task, |t| {
                        t.mark_failed(now);
                        t.result = Some(serde_json::json!({ "error": reason }));
                    })
                    .await?;
                    tracing::error!(parent: &self.span, task_id = %task_id, %reason, "task failed");
                    Ok((Settle::Ack, ProcessOutcome::Failed))
                }
            },
        }
    }

    /// Readiness first, then every transitive dependency must be Completed.
    async fn gate(&self, task: &Task, now: DateTime<Utc>) -> Result<Gate, StoreError> {
        if let Some(scheduled_at) = task.scheduled_at.filter(|at| *at > now) {
            return Ok(Gate::NotReady { scheduled_at });
        }

        let pending: Vec<TaskId> = self
            .store
            .all_dependencies(task.id)
            .await?
            .into_iter()
            .filter(|dep| dep.status != TaskStatus::Completed)
            .map(|dep| dep.id)
            .collect();

        if pending.is_empty() {
            Ok(Gate::Open)
        } else {
            Ok(Gate::DependenciesPending { pending })
        }
    }

    async fn execute(&self, task: &Task) -> Result<serde_json::Value, TaskExecutionError> {
        match self.settings.execution_timeout {
            Some(limit) => tokio::time::timeout(limit, self.executor.execute(task))
                .await
                .unwrap_or_else(|_| Err(TaskExecutionError::TimedOut(limit))),
            None => self.executor.execute(task).await,
        }
    }

    /// Apply `change` and write it back conditionally on the version read.
    async fn save(&self, mut task: Task, change: impl FnOnce(&mut Task)) -> Result<Task, StoreError> {
        let version = task.version;
        change(&mut task);
        self.store.update(task, version).await
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // sender dropped counts as shutdown
    let _ = shutdown.wait_for(|stop| *stop).await;
}
