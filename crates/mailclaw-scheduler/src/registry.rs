//! In-memory task registry and the ready-task selector.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::tasks::{Task, TaskId, TaskStatus, TaskView};

/// All submitted tasks, keyed by id.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskId, Task>,
    next_seq: u64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next submission sequence number.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn insert(&mut self, task: Task) {
        // Restored tasks carry their own seq; keep new ones after them.
        self.next_seq = self.next_seq.max(task.seq + 1);
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Task> {
        self.tasks.remove(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    pub fn status_counts(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_default() += 1;
        }
        counts
    }

    /// Ids of admissible tasks due at `now`, highest priority first,
    /// submission order within a priority.
    pub fn ready(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut ready: Vec<&Task> = self.tasks.values().filter(|t| t.is_ready(now)).collect();
        ready.sort_by_key(|t| (Reverse(t.priority), t.seq));
        ready.into_iter().map(|t| t.id.clone()).collect()
    }

    /// Snapshots ordered by next run time; tasks without one go last.
    pub fn views_by_next_run(&self) -> Vec<TaskView> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| (t.next_run_time.is_none(), t.next_run_time, t.seq));
        tasks.into_iter().map(Task::view).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{TaskPriority, TaskSpec};
    use crate::work::FnWork;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn add(reg: &mut TaskRegistry, spec: TaskSpec) -> TaskId {
        let work = Arc::new(FnWork::new(|_ctx| async { Ok(serde_json::Value::Null) }));
        let seq = reg.next_seq();
        let task = Task::from_spec(spec, work, seq, t0(), 3);
        let id = task.id.clone();
        reg.insert(task);
        id
    }

    #[test]
    fn test_ready_sorted_by_priority_then_submission() {
        let mut reg = TaskRegistry::new();
        let n1 = add(&mut reg, TaskSpec::new("n1"));
        let low = add(&mut reg, TaskSpec::new("low").priority(TaskPriority::Low));
        let n2 = add(&mut reg, TaskSpec::new("n2"));
        let urgent = add(&mut reg, TaskSpec::new("u").priority(TaskPriority::Urgent));
        let high = add(&mut reg, TaskSpec::new("h").priority(TaskPriority::High));

        assert_eq!(reg.ready(t0()), vec![urgent, high, n1, n2, low]);
    }

    #[test]
    fn test_ready_skips_future_and_non_admissible() {
        let mut reg = TaskRegistry::new();
        let due = add(&mut reg, TaskSpec::new("due"));
        add(&mut reg, TaskSpec::new("later").at(t0() + Duration::minutes(5)));
        let running = add(&mut reg, TaskSpec::new("running"));
        reg.get_mut(&running).unwrap().status = TaskStatus::Running;
        let done = add(&mut reg, TaskSpec::new("done"));
        reg.get_mut(&done).unwrap().status = TaskStatus::Completed;

        assert_eq!(reg.ready(t0()), vec![due.clone()]);
        assert_eq!(reg.ready(t0() + Duration::minutes(5)).len(), 2);
    }

    #[test]
    fn test_views_ordered_by_next_run() {
        let mut reg = TaskRegistry::new();
        let late = add(&mut reg, TaskSpec::new("late").at(t0() + Duration::hours(3)));
        let none = add(&mut reg, TaskSpec::new("finished"));
        reg.get_mut(&none).unwrap().next_run_time = None;
        let early = add(&mut reg, TaskSpec::new("early").at(t0() + Duration::hours(1)));

        let ids: Vec<_> = reg.views_by_next_run().into_iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![early, late, none]);
    }

    #[test]
    fn test_status_counts_and_remove() {
        let mut reg = TaskRegistry::new();
        let a = add(&mut reg, TaskSpec::new("a"));
        add(&mut reg, TaskSpec::new("b").at(t0() + Duration::hours(1)));

        let counts = reg.status_counts();
        assert_eq!(counts.get(&TaskStatus::Pending), Some(&1));
        assert_eq!(counts.get(&TaskStatus::Scheduled), Some(&1));
        assert_eq!(reg.count_status(TaskStatus::Running), 0);

        assert!(reg.remove(&a).is_some());
        assert!(reg.remove(&a).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_seq_continues_after_restored_tasks() {
        let mut reg = TaskRegistry::new();
        let work = Arc::new(FnWork::new(|_ctx| async { Ok(serde_json::Value::Null) }));
        reg.insert(Task::from_spec(TaskSpec::new("old"), work, 41, t0(), 3));
        assert_eq!(reg.next_seq(), 42);
    }
}
