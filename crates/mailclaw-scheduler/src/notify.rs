//! Lifecycle notifications: fire-and-forget events for UI listeners.
//! Fan-out over a broadcast channel plus a small in-memory history ring.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::tasks::TaskId;

/// Broadcast buffer per subscriber; slow listeners lag instead of blocking.
const CHANNEL_CAPACITY: usize = 256;

/// A task lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    TaskScheduled {
        id: TaskId,
        name: String,
        time: DateTime<Utc>,
    },
    TaskStarted {
        id: TaskId,
        name: String,
    },
    TaskCompleted {
        id: TaskId,
        name: String,
        result: serde_json::Value,
    },
    /// A run failed and a retry was queued.
    TaskRetrying {
        id: TaskId,
        name: String,
        attempt: u32,
        next_run: DateTime<Utc>,
        error: String,
    },
    TaskFailed {
        id: TaskId,
        name: String,
        error: String,
    },
    TaskCancelled {
        id: TaskId,
        name: String,
    },
}

impl SchedulerEvent {
    pub fn task_id(&self) -> &str {
        match self {
            SchedulerEvent::TaskScheduled { id, .. }
            | SchedulerEvent::TaskStarted { id, .. }
            | SchedulerEvent::TaskCompleted { id, .. }
            | SchedulerEvent::TaskRetrying { id, .. }
            | SchedulerEvent::TaskFailed { id, .. }
            | SchedulerEvent::TaskCancelled { id, .. } => id,
        }
    }

    /// Wire name, e.g. `task_started`.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::TaskScheduled { .. } => "task_scheduled",
            SchedulerEvent::TaskStarted { .. } => "task_started",
            SchedulerEvent::TaskCompleted { .. } => "task_completed",
            SchedulerEvent::TaskRetrying { .. } => "task_retrying",
            SchedulerEvent::TaskFailed { .. } => "task_failed",
            SchedulerEvent::TaskCancelled { .. } => "task_cancelled",
        }
    }
}

/// Event fan-out with bounded history.
pub struct EventEmitter {
    tx: broadcast::Sender<SchedulerEvent>,
    history: Mutex<VecDeque<SchedulerEvent>>,
    history_limit: usize,
}

impl EventEmitter {
    pub fn new(history_limit: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(history_limit.min(1024))),
            history_limit,
        }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    /// Record and broadcast. Never fails: no listeners is fine.
    pub fn emit(&self, event: SchedulerEvent) {
        tracing::debug!("📣 {} {}", event.kind(), event.task_id());
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.push_back(event.clone());
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }
        let _ = self.tx.send(event);
    }

    /// Recorded events, oldest first.
    pub fn history(&self) -> Vec<SchedulerEvent> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(100)
    }
}
