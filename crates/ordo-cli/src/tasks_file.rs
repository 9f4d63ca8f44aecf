//! Tasks file: the task graph `ordo run` and `ordo order` work on.
//!
//! ```toml
//! [task.extract]
//! priority = 1
//!
//! [task.transform]
//! after = ["extract"]
//! max_retries = 2
//! fail_times = 1      # simulated failures before success
//! duration_ms = 200   # simulated work
//!
//! [task.report]
//! after = ["transform"]
//! delay_ms = 5000     # not ready before now + 5s
//! recurrence = "daily"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use ordo_core::app::{ServiceError, TaskService};
use ordo_core::domain::{NewTask, Priority, RecurrenceType, TaskId};

use crate::executor::Behaviour;

/// One year.
pub const MAX_DELAY_MS: u64 = 365 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TasksFile {
    /// All tasks from `[task.<name>]`, keyed by name.
    #[serde(default)]
    pub task: BTreeMap<String, TaskEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskEntry {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    /// Falls back to `tasks.default_max_retries`.
    pub max_retries: Option<u32>,
    /// Names of the tasks this one depends on.
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub recurrence: RecurrenceType,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub fail_times: u32,
}

impl TaskEntry {
    pub fn behaviour(&self) -> Behaviour {
        Behaviour {
            duration: Duration::from_millis(self.duration_ms),
            fail_times: self.fail_times,
        }
    }
}

/// Name <-> id mapping of a tasks file loaded into a store.
#[derive(Debug, Clone, Default)]
pub struct Installed {
    pub ids: BTreeMap<String, TaskId>,
    names: HashMap<TaskId, String>,
}

impl Installed {
    pub fn name(&self, id: TaskId) -> String {
        self.names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    /// `a -> b -> a` with task names.
    pub fn describe_cycle(&self, cycle: &[TaskId]) -> String {
        cycle
            .iter()
            .map(|id| self.name(*id))
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

pub fn load_tasks(path: impl AsRef<Path>) -> Result<TasksFile> {
    let path = path.as_ref();
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading tasks file at {:?}", path))?;
    let file: TasksFile = toml::from_str(&contents)
        .with_context(|| format!("parsing TOML tasks from {:?}", path))?;
    file.validate()?;
    Ok(file)
}

impl TasksFile {
    /// At least one task, every `after` names a task in the file and no
    /// delay beyond `MAX_DELAY_MS`. Cycles are left to the store, which
    /// reports them with the path.
    pub fn validate(&self) -> Result<()> {
        if self.task.is_empty() {
            return Err(anyhow!(
                "tasks file must contain at least one [task.<name>] section"
            ));
        }
        for (name, entry) in &self.task {
            if entry.delay_ms > MAX_DELAY_MS {
                return Err(anyhow!(
                    "task '{}' has delay_ms {} (max {})",
                    name,
                    entry.delay_ms,
                    MAX_DELAY_MS
                ));
            }
            for dep in &entry.after {
                if !self.task.contains_key(dep) {
                    return Err(anyhow!(
                        "task '{}' has unknown dependency '{}' in `after`",
                        name,
                        dep
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn behaviours(&self) -> HashMap<String, Behaviour> {
        self.task
            .iter()
            .map(|(name, entry)| (name.clone(), entry.behaviour()))
            .collect()
    }

    /// Create every task (Pending, not submitted), then add the edges.
    ///
    /// On a cycle the error carries the partially loaded mapping so the
    /// caller can name the tasks on the cycle.
    pub async fn install(
        &self,
        service: &TaskService,
        default_max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Installed, (Installed, ServiceError)> {
        let mut installed = Installed::default();

        let news = self
            .task
            .iter()
            .map(|(name, entry)| new_task(name, entry, default_max_retries, now))
            .collect();
        let created = match service.create_all(news).await {
            Ok(created) => created,
            Err(err) => return Err((installed, err)),
        };
        for task in created {
            installed.names.insert(task.id, task.title.clone());
            installed.ids.insert(task.title, task.id);
        }

        for (name, entry) in &self.task {
            for dep in &entry.after {
                let (Some(&task), Some(&depends_on)) =
                    (installed.ids.get(name), installed.ids.get(dep))
                else {
                    continue;
                };
                if let Err(err) = service.add_dependency(task, depends_on).await {
                    return Err((installed, err));
                }
            }
        }
        Ok(installed)
    }
}

fn new_task(
    name: &str,
    entry: &TaskEntry,
    default_max_retries: u32,
    now: DateTime<Utc>,
) -> NewTask {
    let mut new = NewTask::new(name)
        .with_description(entry.description.clone())
        .with_priority(entry.priority)
        .with_max_retries(entry.max_retries.unwrap_or(default_max_retries))
        .with_recurrence(entry.recurrence);
    if entry.delay_ms > 0 {
        // bounded by MAX_DELAY_MS in validate()
        new = new.scheduled_at(now + chrono::Duration::milliseconds(entry.delay_ms as i64));
    }
    new
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordo_core::impls::{InMemoryBroker, InMemoryTaskStore};
    use ordo_core::ports::SystemClock;
    use ordo_core::queue::{QueueSettings, TaskQueue};
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn write_tasks(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn service() -> TaskService {
        let clock = Arc::new(SystemClock);
        let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
        let queue = Arc::new(TaskQueue::new(
            InMemoryBroker::new().connection(),
            QueueSettings::default(),
        ));
        TaskService::new(store, queue, clock)
    }

    #[test]
    fn parses_entries_with_defaults() {
        let file = write_tasks(
            r#"
[task.a]

[task.b]
after = ["a"]
priority = 3
recurrence = "weekly"
fail_times = 2
"#,
        );
        let tasks = load_tasks(file.path()).unwrap();

        let b = &tasks.task["b"];
        assert_eq!(b.after, vec!["a"]);
        assert_eq!(b.priority, Priority::High);
        assert_eq!(b.recurrence, RecurrenceType::Weekly);
        assert_eq!(b.max_retries, None);
        assert_eq!(tasks.task["a"].priority, Priority::Medium);
        assert_eq!(tasks.behaviours()["b"].fail_times, 2);
    }

    #[test]
    fn unknown_after_is_rejected() {
        let file = write_tasks("[task.a]\nafter = [\"ghost\"]\n");
        let err = load_tasks(file.path()).unwrap_err();
        assert!(err.to_string().contains("ghost"), "{err}");
    }

    #[test]
    fn oversized_delay_is_rejected() {
        let file = write_tasks("[task.a]\ndelay_ms = 99999999999999\n");
        let err = load_tasks(file.path()).unwrap_err();
        assert!(err.to_string().contains("delay_ms"), "{err}");
    }

    #[test]
    fn invalid_priority_is_a_parse_error() {
        let file = write_tasks("[task.a]\npriority = 7\n");
        assert!(load_tasks(file.path()).is_err());
    }

    #[tokio::test]
    async fn install_creates_tasks_and_edges() {
        let file = write_tasks(
            "[task.a]\n[task.b]\nafter = [\"a\"]\nmax_retries = 5\ndelay_ms = 60000\n",
        );
        let tasks = load_tasks(file.path()).unwrap();
        let svc = service();
        let now = Utc::now();

        let installed = tasks.install(&svc, 3, now).await.unwrap();
        let b = svc.get(installed.ids["b"]).await.unwrap();

        assert_eq!(b.max_retries, 5);
        assert_eq!(b.scheduled_at, Some(now + chrono::Duration::seconds(60)));
        assert!(b.dependencies.contains(&installed.ids["a"]));
        assert_eq!(svc.get(installed.ids["a"]).await.unwrap().max_retries, 3);
    }

    #[tokio::test]
    async fn cycle_is_reported_by_name() {
        let file = write_tasks(
            "[task.a]\nafter = [\"b\"]\n[task.b]\nafter = [\"a\"]\n",
        );
        let tasks = load_tasks(file.path()).unwrap();

        let (installed, err) = tasks.install(&service(), 0, Utc::now()).await.unwrap_err();
        let ServiceError::Cycle(cycle) = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(installed.describe_cycle(&cycle.cycle), "b -> a -> b");
    }
}
