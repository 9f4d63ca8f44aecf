//! Task record: the canonical state of a unit of schedulable work.
//!
//! The record is owned by the store. Everything else (queue, worker) holds
//! snapshots and writes back through conditional updates keyed on `version`.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// Task status.
///
/// State transitions:
/// - Pending -> Queued (published to the queue)
/// - Queued -> InProgress -> Completed
/// - Queued -> InProgress -> Queued (deferred by a gate, or retry; bounded by max_retries)
/// - Queued -> InProgress -> Failed (retries exhausted)
/// - Completed -> InProgress (recurring tasks only, once the next
///   `scheduled_at` is reached)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Is this a terminal state for the current delivery? A recurring task
    /// leaves Completed again when its next run is due.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.pad(s)
    }
}

/// Queue priority, 1 (low) to 3 (high).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Low = 1,
    #[default]
    Medium = 2,
    High = 3,
}

impl Priority {
    /// Number of distinct priority levels a live queue is declared with.
    pub const LEVELS: u8 = 3;

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = InvalidPriority;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Medium),
            3 => Ok(Priority::High),
            other => Err(InvalidPriority(other)),
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.as_u8()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("priority must be between 1 and 3, got {0}")]
pub struct InvalidPriority(pub u8);

/// Recurrence rule for tasks that run again after completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceType {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
}

impl RecurrenceType {
    /// The recurrence period. Monthly is a fixed 30 days.
    pub fn interval(self) -> Option<Duration> {
        match self {
            RecurrenceType::None => None,
            RecurrenceType::Daily => Some(Duration::days(1)),
            RecurrenceType::Weekly => Some(Duration::weeks(1)),
            RecurrenceType::Monthly => Some(Duration::days(30)),
        }
    }

    pub fn next_after(self, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.interval().map(|step| base + step)
    }

    pub fn is_recurring(self) -> bool {
        self != RecurrenceType::None
    }
}

/// Canonical task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,

    /// Failed executions that were sent back for another attempt.
    pub retry_count: u32,
    pub max_retries: u32,

    /// Not ready to run before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub recurrence: RecurrenceType,
    pub last_run_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,

    /// Ids this task depends on. Filled from the store's edge index; writes
    /// go through the store's dependency operations, not through `update`.
    pub dependencies: BTreeSet<TaskId>,

    /// Optimistic concurrency token, bumped by the store on every update.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Readiness gate: `scheduled_at` unset or already reached.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }

    pub fn mark_queued(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Queued;
        self.updated_at = now;
    }

    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::InProgress;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.last_run_at = Some(now);
        self.updated_at = now;
    }

    /// Count one more failed attempt and send the task back to the queue.
    pub fn mark_retrying(&mut self, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.status = TaskStatus::Queued;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.updated_at = now;
    }

    /// Advance `scheduled_at` by one recurrence period. The base is the
    /// previous schedule when there was one, so a recurring task keeps its
    /// cadence; otherwise the completion time.
    ///
    /// Status is left alone: the record stays Completed (dependents see a
    /// finished run) until the next delivery picks it up again.
    pub fn reschedule(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let base = self.scheduled_at.unwrap_or(now);
        let next = self.recurrence.next_after(base)?;
        self.scheduled_at = Some(next);
        self.updated_at = now;
        Some(next)
    }

    /// A completed recurring task whose next run has come.
    pub fn is_due_again(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Completed
            && self.recurrence.is_recurring()
            && self.is_ready(now)
    }
}

/// Input for creating a task. The store assigns id, status and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recurrence: RecurrenceType,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            priority: Priority::default(),
            max_retries: 0,
            scheduled_at: None,
            recurrence: RecurrenceType::None,
            dependencies: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_recurrence(mut self, recurrence: RecurrenceType) -> Self {
        self.recurrence = recurrence;
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        self.dependencies.insert(id);
        self
    }

    /// Materialize the record as the store persists it.
    pub fn into_task(self, id: TaskId, now: DateTime<Utc>) -> Task {
        Task {
            id,
            title: self.title,
            description: self.description,
            status: TaskStatus::Pending,
            priority: self.priority,
            retry_count: 0,
            max_retries: self.max_retries,
            scheduled_at: self.scheduled_at,
            recurrence: self.recurrence,
            last_run_at: None,
            result: None,
            dependencies: self.dependencies,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 5, h, 0, 0).unwrap()
    }

    #[rstest]
    #[case::none(RecurrenceType::None, None)]
    #[case::daily(RecurrenceType::Daily, Some(Duration::days(1)))]
    #[case::weekly(RecurrenceType::Weekly, Some(Duration::days(7)))]
    #[case::monthly(RecurrenceType::Monthly, Some(Duration::days(30)))]
    fn recurrence_intervals(#[case] rule: RecurrenceType, #[case] expected: Option<Duration>) {
        assert_eq!(rule.interval(), expected);
    }

    #[rstest]
    #[case(0, false)]
    #[case(1, true)]
    #[case(3, true)]
    #[case(4, false)]
    fn priority_accepts_only_three_levels(#[case] raw: u8, #[case] ok: bool) {
        assert_eq!(Priority::try_from(raw).is_ok(), ok);
    }

    #[test]
    fn priority_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "3");
        let p: Priority = serde_json::from_str("1").unwrap();
        assert_eq!(p, Priority::Low);
        assert!(serde_json::from_str::<Priority>("7").is_err());
    }

    #[test]
    fn readiness_gate_follows_scheduled_at() {
        let mut task = NewTask::new("t").into_task(TaskId::from_u128(1), at(8));
        assert!(task.is_ready(at(8)));

        task.scheduled_at = Some(at(10));
        assert!(!task.is_ready(at(9)));
        assert!(task.is_ready(at(10)));
    }

    #[test]
    fn reschedule_without_schedule_uses_completion_time() {
        let mut task = NewTask::new("daily")
            .with_recurrence(RecurrenceType::Daily)
            .into_task(TaskId::from_u128(1), at(8));
        task.mark_completed(serde_json::json!(true), at(9));

        let next = task.reschedule(at(9)).unwrap();
        assert_eq!(next, at(9) + Duration::hours(24));
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.last_run_at, Some(at(9)));
        assert!(!task.is_due_again(at(10)));
        assert!(task.is_due_again(next));
    }

    #[test]
    fn reschedule_keeps_cadence_of_previous_schedule() {
        let mut task = NewTask::new("weekly")
            .with_recurrence(RecurrenceType::Weekly)
            .scheduled_at(at(6))
            .into_task(TaskId::from_u128(1), at(5));

        let next = task.reschedule(at(9)).unwrap();
        assert_eq!(next, at(6) + Duration::weeks(1));
    }

    #[test]
    fn non_recurring_task_is_not_rescheduled() {
        let mut task = NewTask::new("once").into_task(TaskId::from_u128(1), at(8));
        task.mark_completed(serde_json::json!(null), at(9));
        assert!(task.reschedule(at(9)).is_none());
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(!task.is_due_again(at(9)));
    }
}
