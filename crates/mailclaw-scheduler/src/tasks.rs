//! Task definitions: the core data model for scheduled work.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::work::TaskWork;

/// Process-unique task identifier (`task-<uuid>`).
pub type TaskId = String;

/// Opaque key/value bag carried by a task and passed through untouched.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Work kind for tasks built directly through [`TaskSpec`].
pub const KIND_CUSTOM: &str = "custom";

/// Task priority. Declaration order is the admission order, lowest first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "urgent" => Ok(TaskPriority::Urgent),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Task status.
///
/// `Pending`/`Scheduled` are admissible, `Running` is in flight, and the
/// remaining three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the tick may admit a task in this status.
    pub fn is_admissible(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Scheduled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "scheduled" => Ok(TaskStatus::Scheduled),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// Submission parameters for a new task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub description: String,
    /// When to first run. `None` means now.
    pub scheduled_time: Option<DateTime<Utc>>,
    pub priority: TaskPriority,
    pub recurring: bool,
    pub interval_minutes: u32,
    /// `None` falls back to the scheduler's configured default.
    pub max_retries: Option<u32>,
    pub metadata: Metadata,
    pub kind: String,
}

impl TaskSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            scheduled_time: None,
            priority: TaskPriority::Normal,
            recurring: false,
            interval_minutes: 0,
            max_retries: None,
            metadata: Metadata::new(),
            kind: KIND_CUSTOM.to_string(),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(time);
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Make the task recurring with the given period.
    pub fn every_minutes(mut self, minutes: u32) -> Self {
        self.recurring = true;
        self.interval_minutes = minutes;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = kind.to_string();
        self
    }
}

/// A scheduled task: immutable identity plus mutable execution state.
///
/// Only the scheduler mutates a `Task`; callers see [`TaskView`] snapshots.
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub scheduled_time: DateTime<Utc>,
    pub created_time: DateTime<Utc>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub recurring: bool,
    pub interval_minutes: u32,
    pub max_retries: u32,
    pub retry_count: u32,
    pub metadata: Metadata,
    pub kind: String,
    /// Submission order, used to break priority ties.
    pub seq: u64,
    pub run_count: u32,
    pub last_error: Option<String>,
    /// Set when a running task is cancelled; applied when its run returns.
    pub cancel_requested: bool,
    pub(crate) work: Arc<dyn TaskWork>,
    pub(crate) cancel: Option<CancellationToken>,
}

impl Task {
    pub(crate) fn from_spec(
        spec: TaskSpec,
        work: Arc<dyn TaskWork>,
        seq: u64,
        now: DateTime<Utc>,
        default_max_retries: u32,
    ) -> Self {
        let scheduled_time = spec.scheduled_time.unwrap_or(now);
        let status = if scheduled_time <= now {
            TaskStatus::Pending
        } else {
            TaskStatus::Scheduled
        };
        Self {
            id: new_task_id(),
            name: spec.name,
            description: spec.description,
            priority: spec.priority,
            status,
            scheduled_time,
            created_time: now,
            last_run_time: None,
            next_run_time: Some(scheduled_time),
            recurring: spec.recurring,
            interval_minutes: spec.interval_minutes,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            retry_count: 0,
            metadata: spec.metadata,
            kind: spec.kind,
            seq,
            run_count: 0,
            last_error: None,
            cancel_requested: false,
            work,
            cancel: None,
        }
    }

    /// Rebuild a task from a journal snapshot.
    pub(crate) fn from_view(view: TaskView, work: Arc<dyn TaskWork>) -> Self {
        Self {
            id: view.id,
            name: view.name,
            description: view.description,
            priority: view.priority,
            status: view.status,
            scheduled_time: view.scheduled_time,
            created_time: view.created_time,
            last_run_time: view.last_run_time,
            next_run_time: view.next_run_time,
            recurring: view.recurring,
            interval_minutes: view.interval_minutes,
            max_retries: view.max_retries,
            retry_count: view.retry_count.min(view.max_retries),
            metadata: view.metadata,
            kind: view.kind,
            seq: view.seq,
            run_count: view.run_count,
            last_error: view.last_error,
            cancel_requested: false,
            work,
            cancel: None,
        }
    }

    /// Check if this task may be admitted at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_admissible() && self.next_run_time.is_some_and(|next| next <= now)
    }

    /// Read-only snapshot without the work handle.
    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            priority: self.priority,
            status: self.status,
            scheduled_time: self.scheduled_time,
            created_time: self.created_time,
            last_run_time: self.last_run_time,
            next_run_time: self.next_run_time,
            recurring: self.recurring,
            interval_minutes: self.interval_minutes,
            max_retries: self.max_retries,
            retry_count: self.retry_count,
            metadata: self.metadata.clone(),
            kind: self.kind.clone(),
            seq: self.seq,
            run_count: self.run_count,
            last_error: self.last_error.clone(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("status", &self.status)
            .field("next_run_time", &self.next_run_time)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// Serializable snapshot of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub scheduled_time: DateTime<Utc>,
    pub created_time: DateTime<Utc>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub recurring: bool,
    pub interval_minutes: u32,
    pub max_retries: u32,
    pub retry_count: u32,
    pub metadata: Metadata,
    pub kind: String,
    pub seq: u64,
    pub run_count: u32,
    pub last_error: Option<String>,
}

fn new_task_id() -> TaskId {
    format!("task-{}", uuid::Uuid::new_v4().simple())
}
