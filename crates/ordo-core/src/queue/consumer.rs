//! Typed consumer side of the task queue.

use tracing::Span;

use crate::domain::{QueueError, TaskEnvelope, TaskId};
use crate::ports::{Delivery, Subscription};

/// Decodes deliveries from the live queue into task envelopes.
pub struct TaskConsumer {
    subscription: Box<dyn Subscription>,
    span: Span,
}

impl TaskConsumer {
    pub(crate) fn new(subscription: Box<dyn Subscription>, span: Span) -> Self {
        Self { subscription, span }
    }

    /// Wait for the next task. `None` once the connection is gone.
    ///
    /// A message that is not a valid envelope can never succeed, so it is
    /// rejected without requeue instead of being handed out.
    pub async fn next(&mut self) -> Option<TaskDelivery> {
        loop {
            let delivery = self.subscription.next().await?;
            match TaskEnvelope::decode(delivery.body()) {
                Ok(envelope) => {
                    return Some(TaskDelivery {
                        envelope,
                        inner: delivery,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        parent: &self.span,
                        delivery_tag = delivery.delivery_tag(),
                        error = %err,
                        "malformed task message dropped"
                    );
                    if let Err(err) = delivery.reject(false).await {
                        tracing::warn!(parent: &self.span, error = %err, "reject failed");
                    }
                }
            }
        }
    }
}

/// One delivered task. Must be settled with `ack` or `requeue`.
pub struct TaskDelivery {
    envelope: TaskEnvelope,
    inner: Box<dyn Delivery>,
}

impl TaskDelivery {
    pub fn envelope(&self) -> &TaskEnvelope {
        &self.envelope
    }

    pub fn task_id(&self) -> TaskId {
        self.envelope.task_id()
    }

    pub fn redelivered(&self) -> bool {
        self.inner.redelivered()
    }

    /// Remove the message permanently.
    pub async fn ack(self) -> Result<(), QueueError> {
        self.inner.ack().await?;
        Ok(())
    }

    /// Hand the message back for redelivery.
    pub async fn requeue(self) -> Result<(), QueueError> {
        self.inner.reject(true).await?;
        Ok(())
    }
}
