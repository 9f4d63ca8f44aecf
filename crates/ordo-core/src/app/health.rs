//! Health check: can we reach the broker and the task store?

use serde::Serialize;

use crate::ports::TaskStore;
use crate::queue::TaskQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn from_result<E: std::fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self {
                ok: true,
                error: None,
            },
            Err(err) => Self {
                ok: false,
                error: Some(err.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub queue: ComponentHealth,
    pub store: ComponentHealth,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Connect to the broker (a no-op when already connected) and ping the
/// store.
pub async fn check(queue: &TaskQueue, store: &dyn TaskStore) -> HealthReport {
    let queue = ComponentHealth::from_result(queue.connect().await);
    let store = ComponentHealth::from_result(store.ping().await);
    let status = if queue.ok && store.ok {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    };
    HealthReport {
        status,
        queue,
        store,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryBroker, InMemoryTaskStore};
    use crate::ports::SystemClock;
    use crate::queue::QueueSettings;
    use std::sync::Arc;

    #[tokio::test]
    async fn healthy_when_both_reachable() {
        let broker = InMemoryBroker::new();
        let queue = TaskQueue::new(broker.connection(), QueueSettings::default());
        let store = InMemoryTaskStore::new(Arc::new(SystemClock));

        let report = check(&queue, &store).await;
        assert!(report.is_healthy());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["queue"]["ok"], true);
        assert!(json["queue"].get("error").is_none());
    }

    #[tokio::test]
    async fn unhealthy_when_broker_is_down() {
        let broker = InMemoryBroker::new();
        broker.set_available(false).await;
        let queue = TaskQueue::new(broker.connection(), QueueSettings::default());
        let store = InMemoryTaskStore::new(Arc::new(SystemClock));

        let report = check(&queue, &store).await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.queue.ok);
        assert!(report.store.ok);
        assert_eq!(report.queue.error.as_deref(), Some("task queue unavailable"));
    }
}
