//! End-to-end scheduling: service -> broker -> worker group -> store.
//!
//! Time is paused; `TokioClock` follows tokio's clock so broker TTLs and
//! task readiness move together.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use ordo_core::app::{TaskService, Worker, WorkerGroup, WorkerSettings};
use ordo_core::domain::{
    NewTask, Priority, RecurrenceType, Task, TaskExecutionError, TaskId, TaskStatus,
};
use ordo_core::impls::{InMemoryBroker, InMemoryTaskStore};
use ordo_core::ports::{Clock, TaskExecutor, TaskStore};
use ordo_core::queue::{QueueSettings, TaskQueue};

const POLL: Duration = Duration::from_millis(50);

struct TokioClock {
    base: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl TokioClock {
    fn new() -> Self {
        Self {
            base: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.start.elapsed()).unwrap();
        self.base + elapsed
    }
}

/// Records titles in execution order; titles listed in `failing` always fail.
#[derive(Default)]
struct Recorder {
    runs: Mutex<Vec<String>>,
    failing: Vec<String>,
}

impl Recorder {
    fn failing(titles: &[&str]) -> Self {
        Self {
            runs: Mutex::new(Vec::new()),
            failing: titles.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }

    fn count(&self, title: &str) -> usize {
        self.runs().iter().filter(|t| *t == title).count()
    }
}

#[async_trait]
impl TaskExecutor for Recorder {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, TaskExecutionError> {
        self.runs.lock().unwrap().push(task.title.clone());
        if self.failing.contains(&task.title) {
            return Err(TaskExecutionError::failed("boom"));
        }
        Ok(serde_json::json!({ "title": task.title }))
    }
}

struct Harness {
    service: TaskService,
    store: Arc<InMemoryTaskStore>,
    recorder: Arc<Recorder>,
    group: WorkerGroup,
}

fn harness(workers: usize, recorder: Recorder) -> Harness {
    let broker = InMemoryBroker::new();
    let clock = Arc::new(TokioClock::new());
    let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
    let recorder = Arc::new(recorder);
    let settings = WorkerSettings {
        redelivery_delay: Duration::from_secs(60),
        ..WorkerSettings::default()
    };

    let group = WorkerGroup::spawn(
        (0..workers)
            .map(|id| {
                Worker::new(
                    id,
                    TaskQueue::new(broker.connection(), QueueSettings::default()),
                    store.clone(),
                    recorder.clone(),
                    clock.clone(),
                    settings.clone(),
                )
            })
            .collect(),
    );
    let queue = Arc::new(TaskQueue::new(broker.connection(), QueueSettings::default()));
    let service = TaskService::new(store.clone(), queue, clock);

    Harness {
        service,
        store,
        recorder,
        group,
    }
}

/// Poll every `step` of (paused) time until `done` holds.
async fn wait_until(
    store: &InMemoryTaskStore,
    id: TaskId,
    step: Duration,
    done: impl Fn(&Task) -> bool,
) -> Task {
    for _ in 0..10_000 {
        let task = store.get(id).await.unwrap();
        if done(&task) {
            return task;
        }
        tokio::time::sleep(step).await;
    }
    panic!("task {id} never reached the expected state");
}

#[tokio::test(start_paused = true)]
async fn failing_task_is_retried_then_failed() {
    let h = harness(1, Recorder::failing(&["flaky"]));
    let task = h
        .service
        .create_task(NewTask::new("flaky").with_max_retries(2))
        .await
        .unwrap();

    let task = wait_until(&h.store, task.id, POLL, |t| t.status == TaskStatus::Failed).await;
    h.group.shutdown_and_join().await;

    assert_eq!(task.retry_count, 2);
    assert_eq!(h.recorder.count("flaky"), 3);
    let reason = task.result.as_ref().and_then(|r| r["error"].as_str()).unwrap();
    assert!(reason.contains("boom"), "{reason}");
}

#[tokio::test(start_paused = true)]
async fn future_task_waits_for_its_schedule() {
    let h = harness(1, Recorder::default());
    let scheduled_at = TokioClock::new().base + chrono::Duration::seconds(90);
    let task = h
        .service
        .create_task(NewTask::new("later").scheduled_at(scheduled_at))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Queued);

    let task = wait_until(&h.store, task.id, POLL, |t| t.status == TaskStatus::Completed).await;
    h.group.shutdown_and_join().await;

    assert!(task.last_run_at.unwrap() >= scheduled_at);
    assert_eq!(h.recorder.count("later"), 1);
}

#[tokio::test(start_paused = true)]
async fn dependencies_run_first_regardless_of_priority() {
    let h = harness(1, Recorder::default());
    let created = h
        .service
        .create_all(vec![
            NewTask::new("extract").with_priority(Priority::Low),
            NewTask::new("transform"),
        ])
        .await
        .unwrap();
    let (extract, transform) = (created[0].id, created[1].id);
    h.service.add_dependency(transform, extract).await.unwrap();
    let load = h
        .store
        .create(
            NewTask::new("load")
                .with_priority(Priority::High)
                .depends_on(transform),
        )
        .await
        .unwrap();

    h.service.submit(load.id).await.unwrap();
    wait_until(&h.store, load.id, POLL, |t| t.status == TaskStatus::Completed).await;
    h.group.shutdown_and_join().await;

    let runs = h.recorder.runs();
    assert_eq!(runs, vec!["extract", "transform", "load"]);
    let counts = h.service.status_counts().await.unwrap();
    assert_eq!(counts.completed, 3);
    assert_eq!(counts.total(), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_dependency_never_releases_dependent() {
    let h = harness(2, Recorder::failing(&["upstream"]));
    let upstream = h.service.create_all(vec![NewTask::new("upstream")]).await.unwrap()[0].id;
    let downstream = h
        .store
        .create(NewTask::new("downstream").depends_on(upstream))
        .await
        .unwrap();

    h.service.submit(downstream.id).await.unwrap();
    wait_until(&h.store, upstream, POLL, |t| t.status == TaskStatus::Failed).await;
    tokio::time::sleep(Duration::from_secs(600)).await;
    h.group.shutdown_and_join().await;

    assert_eq!(h.recorder.count("downstream"), 0);
    let downstream = h.store.get(downstream.id).await.unwrap();
    assert_eq!(downstream.status, TaskStatus::Queued);
}

#[tokio::test(start_paused = true)]
async fn daily_task_keeps_its_cadence() {
    let h = harness(1, Recorder::default());
    let task = h
        .service
        .create_task(NewTask::new("report").with_recurrence(RecurrenceType::Daily))
        .await
        .unwrap();

    let hourly = Duration::from_secs(3600);
    let first = wait_until(&h.store, task.id, POLL, |t| {
        t.last_run_at.is_some() && t.status == TaskStatus::Completed
    })
    .await;
    let first_next = first.scheduled_at.unwrap();
    assert_eq!(first_next - first.last_run_at.unwrap(), chrono::Duration::days(1));

    let second = wait_until(&h.store, task.id, hourly, |t| {
        t.last_run_at > first.last_run_at && t.status == TaskStatus::Completed
    })
    .await;
    h.group.shutdown_and_join().await;

    assert!(second.last_run_at.unwrap() >= first_next);
    assert_eq!(second.scheduled_at, Some(first_next + chrono::Duration::days(1)));
    assert_eq!(h.recorder.count("report"), 2);
    assert_eq!(h.store.list_all().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn task_after_a_daily_task_runs_once_it_has_run() {
    let h = harness(1, Recorder::default());
    let daily = h
        .service
        .create_all(vec![
            NewTask::new("snapshot").with_recurrence(RecurrenceType::Daily),
        ])
        .await
        .unwrap()[0]
        .id;
    let report = h
        .store
        .create(NewTask::new("report").depends_on(daily))
        .await
        .unwrap();

    h.service.submit(report.id).await.unwrap();
    let report = wait_until(&h.store, report.id, POLL, |t| t.status == TaskStatus::Completed).await;
    h.group.shutdown_and_join().await;

    assert_eq!(h.recorder.runs(), vec!["snapshot", "report"]);
    let snapshot = h.store.get(daily).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert!(snapshot.scheduled_at.unwrap() > report.last_run_at.unwrap());
}
