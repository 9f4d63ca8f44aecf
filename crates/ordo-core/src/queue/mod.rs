//! Task queue: durable, priority- and delay-capable delivery of tasks.
//!
//! Design:
//! - One live queue (`settings.name`), durable, declared with
//!   `Priority::LEVELS` priority levels.
//! - Delays use per-delay queues named `{queue}.delay.{ms}`: the message TTL
//!   is the delay and expired messages dead-letter into the live queue. The
//!   payload never carries the delay. Delays are rounded up to
//!   `DELAY_STEP`, and a delay queue expires once it has been unused for
//!   its TTL plus `DELAY_QUEUE_GRACE`, so one-off delays do not pile up.
//! - Every publish runs inside a channel transaction; on failure it is
//!   rolled back, so nothing partial becomes visible.
//! - A dead connection is reopened once per publish before giving up with
//!   `QueueError::Unavailable`.

mod consumer;

pub use consumer::{TaskConsumer, TaskDelivery};

use std::time::Duration;

use tracing::Span;

use crate::domain::{
    Priority, QueueError, StoreError, Task, TaskEnvelope, TaskStatus, TransportError,
};
use crate::graph;
use crate::ports::{Clock, OutboundMessage, QueueDeclaration, TaskStore, Transport};

/// Messages a worker connection holds unsettled at once.
pub const PREFETCH: u16 = 1;

/// Delays are rounded up to a multiple of this.
pub const DELAY_STEP: Duration = Duration::from_millis(100);

/// How long an unused delay queue outlives its TTL.
pub const DELAY_QUEUE_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Live queue name, also the routing key.
    pub name: String,
    /// Delay applied when `submit_task` publishes a dependency that is not
    /// ready yet.
    pub dependency_backoff: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "task_queue".to_string(),
            dependency_backoff: Duration::from_secs(60),
        }
    }
}

pub struct TaskQueue {
    transport: Box<dyn Transport>,
    settings: QueueSettings,
    span: Span,
}

impl TaskQueue {
    pub fn new(transport: impl Transport + 'static, settings: QueueSettings) -> Self {
        let span = tracing::info_span!("task_queue", queue = %settings.name);
        Self {
            transport: Box::new(transport),
            settings,
            span,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    fn live_queue(&self) -> QueueDeclaration {
        QueueDeclaration::durable(&self.settings.name).with_max_priority(Priority::LEVELS)
    }

    /// Delay queue for `delay`, rounded up to `DELAY_STEP`.
    pub fn delay_queue(&self, delay: Duration) -> QueueDeclaration {
        let step = DELAY_STEP.as_millis();
        let millis = delay.as_millis().div_ceil(step) * step;
        let ttl = Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX));
        QueueDeclaration::durable(format!("{}.delay.{}", self.settings.name, ttl.as_millis()))
            .with_dead_letter(ttl, &self.settings.name)
            .with_expiry(ttl.saturating_add(DELAY_QUEUE_GRACE))
    }

    /// Open the connection and declare the live queue. No-op when already
    /// connected.
    pub async fn connect(&self) -> Result<(), QueueError> {
        if self.transport.is_open().await {
            return Ok(());
        }
        self.transport
            .connect()
            .await
            .map_err(QueueError::Unavailable)?;
        self.transport.declare_queue(&self.live_queue()).await?;
        tracing::debug!(parent: &self.span, "connected");
        Ok(())
    }

    /// Release the connection. Safe to call repeatedly.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.transport.close().await?;
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.is_open().await
    }

    /// Publish `task` with `priority`. A zero `delay` goes straight to the
    /// live queue; anything else waits in a delay queue first.
    pub async fn publish(
        &self,
        task: &Task,
        priority: Priority,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let body = TaskEnvelope::from_task(task)
            .with_priority(priority)
            .encode()
            .map_err(QueueError::Encode)?;
        let message = OutboundMessage::persistent(body, priority.as_u8());
        let target = (!delay.is_zero()).then(|| self.delay_queue(delay));

        let reconnected = !self.transport.is_open().await;
        if reconnected {
            self.connect().await?;
        }

        match self.send(target.as_ref(), &message).await {
            Ok(()) => {}
            Err(err) if is_connection_error(&err) && !reconnected => {
                tracing::warn!(parent: &self.span, error = %err, "connection lost, reconnecting once");
                self.connect().await?;
                self.send(target.as_ref(), &message)
                    .await
                    .map_err(publish_error)?;
            }
            Err(err) => return Err(publish_error(err)),
        }

        tracing::debug!(
            parent: &self.span,
            task_id = %task.id,
            priority = priority.as_u8(),
            delay_ms = delay.as_millis() as u64,
            "task published"
        );
        Ok(())
    }

    /// One transactional send. Rolls back on any failure after `tx_select`.
    async fn send(
        &self,
        target: Option<&QueueDeclaration>,
        message: &OutboundMessage,
    ) -> Result<(), TransportError> {
        let routing_key = match target {
            Some(declaration) => {
                self.transport.declare_queue(declaration).await?;
                declaration.name.as_str()
            }
            None => self.settings.name.as_str(),
        };

        self.transport.tx_select().await?;
        let sent = async {
            self.transport.publish(routing_key, message.clone()).await?;
            self.transport.tx_commit().await
        }
        .await;

        if let Err(err) = sent {
            if let Err(rollback) = self.transport.tx_rollback().await {
                tracing::warn!(parent: &self.span, error = %rollback, "rollback failed");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Publish `task` after every transitive dependency that has not been
    /// queued yet.
    ///
    /// Dependencies go out in dependency order. One that is not ready yet
    /// (`scheduled_at` in the future) is delayed by `dependency_backoff`;
    /// the same rule applies to the task itself. Everything published while
    /// Pending is marked Queued.
    pub async fn submit_task(
        &self,
        task: &Task,
        store: &dyn TaskStore,
        clock: &dyn Clock,
    ) -> Result<(), QueueError> {
        let now = clock.now();
        let dependencies = store.all_dependencies(task.id).await?;
        let ordered = graph::resolve(dependencies).map_err(StoreError::from)?;

        for dependency in ordered {
            if dependency.status != TaskStatus::Pending {
                continue;
            }
            self.publish(&dependency, dependency.priority, self.backoff_for(&dependency, now))
                .await?;
            mark_queued(store, dependency, now).await?;
        }

        self.publish(task, task.priority, self.backoff_for(task, now))
            .await?;
        mark_queued(store, task.clone(), now).await?;
        Ok(())
    }

    fn backoff_for(&self, task: &Task, now: chrono::DateTime<chrono::Utc>) -> Duration {
        if task.is_ready(now) {
            Duration::ZERO
        } else {
            self.settings.dependency_backoff
        }
    }

    /// Subscribe to the live queue with manual acknowledgement and a
    /// prefetch of one.
    pub async fn consume(&self) -> Result<TaskConsumer, QueueError> {
        self.connect().await?;
        let subscription = self
            .transport
            .consume(&self.settings.name, PREFETCH)
            .await?;
        Ok(TaskConsumer::new(subscription, self.span.clone()))
    }
}

fn is_connection_error(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::ConnectionClosed | TransportError::Unavailable(_)
    )
}

fn publish_error(err: TransportError) -> QueueError {
    if is_connection_error(&err) {
        QueueError::Unavailable(err)
    } else {
        QueueError::PublishFailed(err)
    }
}

/// Pending -> Queued. A version conflict means a worker already picked the
/// task up, which is fine.
async fn mark_queued(
    store: &dyn TaskStore,
    mut task: Task,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(), QueueError> {
    if task.status != TaskStatus::Pending {
        return Ok(());
    }
    let version = task.version;
    task.mark_queued(now);
    match store.update(task, version).await {
        Ok(_) | Err(StoreError::Conflict { .. }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
