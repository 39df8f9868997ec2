//! Retry/backoff and recurrence policies.
//!
//! Both policies are pure: they take a task and a timestamp, mutate the
//! task's schedule, and return what happened so the engine can emit the
//! matching event.

use chrono::{DateTime, Duration, Utc};

use crate::tasks::{Task, TaskStatus};

/// Largest backoff exponent; 2^20 minutes is about two years.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// What a successful run leads to.
#[derive(Debug, Clone, PartialEq)]
pub enum SuccessOutcome {
    /// Non-recurring success.
    Completed,
    /// Recurring success, next run queued.
    Rescheduled { next_run: DateTime<Utc> },
}

/// What a failed run leads to.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Retries left.
    Retrying {
        attempt: u32,
        next_run: DateTime<Utc>,
        error: String,
    },
    /// Retries exhausted.
    Failed { error: String },
}

/// Exponential backoff: the k-th retry waits 2^k minutes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    pub fn backoff_delay(retry: u32) -> Duration {
        Duration::minutes(1i64 << retry.min(MAX_BACKOFF_EXPONENT))
    }

    /// Apply a failed run. `retry_count` counts retries already spent, so
    /// a task gets `max_retries + 1` runs per cycle before it fails.
    pub fn on_failure(&self, task: &mut Task, now: DateTime<Utc>, error: &str) -> FailureOutcome {
        task.last_error = Some(error.to_string());
        if task.retry_count < task.max_retries {
            task.retry_count += 1;
            let next_run = now + Self::backoff_delay(task.retry_count);
            task.next_run_time = Some(next_run);
            task.status = TaskStatus::Scheduled;
            FailureOutcome::Retrying {
                attempt: task.retry_count,
                next_run,
                error: error.to_string(),
            }
        } else {
            task.next_run_time = None;
            task.status = TaskStatus::Failed;
            FailureOutcome::Failed {
                error: error.to_string(),
            }
        }
    }
}

/// Decides what a successful run leads to.
#[derive(Debug, Clone, Copy)]
pub struct RecurrencePolicy {
    /// Start each recurrence with a fresh retry budget.
    pub reset_retries: bool,
}

impl RecurrencePolicy {
    pub fn new(reset_retries: bool) -> Self {
        Self { reset_retries }
    }

    pub fn on_success(&self, task: &mut Task, now: DateTime<Utc>) -> SuccessOutcome {
        task.last_error = None;
        if task.recurring && task.interval_minutes > 0 {
            let next_run = now + Duration::minutes(i64::from(task.interval_minutes));
            task.next_run_time = Some(next_run);
            task.status = TaskStatus::Scheduled;
            if self.reset_retries {
                task.retry_count = 0;
            }
            SuccessOutcome::Rescheduled { next_run }
        } else {
            task.next_run_time = None;
            task.status = TaskStatus::Completed;
            SuccessOutcome::Completed
        }
    }
}

impl Default for RecurrencePolicy {
    fn default() -> Self {
        Self::new(true)
    }
}
