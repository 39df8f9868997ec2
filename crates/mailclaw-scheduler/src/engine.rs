//! Scheduler Engine: admits ready tasks and dispatches them to workers.
//!
//! A tick only selects and dispatches: each admitted task runs on its own
//! tokio task holding one permit of a semaphore sized to
//! `max_concurrent_tasks`, so a slow task body never delays the next tick.
//! When a run returns, the retry or recurrence policy decides the task's
//! next state under the registry lock.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use mailclaw_core::SchedulerConfig;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::notify::{EventEmitter, SchedulerEvent};
use crate::persistence::SchedulerDb;
use crate::policy::{FailureOutcome, RecurrencePolicy, RetryPolicy, SuccessOutcome};
use crate::registry::TaskRegistry;
use crate::tasks::{Task, TaskId, TaskSpec, TaskStatus, TaskView};
use crate::work::{TaskContext, TaskError, TaskWork};

/// The task scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<SchedulerState>,
    slots: Arc<Semaphore>,
    enabled: AtomicBool,
    events: EventEmitter,
    retry: RetryPolicy,
    recurrence: RecurrencePolicy,
}

struct SchedulerState {
    registry: TaskRegistry,
    db: Option<SchedulerDb>,
}

/// Journal tables are trimmed once every this many recorded events.
const PRUNE_EVERY: i64 = 256;

impl SchedulerState {
    /// Trim the journal down to `keep` events and `keep` finished tasks.
    fn prune(&self, keep: usize) {
        let Some(db) = &self.db else {
            return;
        };
        match (db.prune_events(keep), db.prune_finished_tasks(keep)) {
            (Ok(events), Ok(tasks)) if events + tasks > 0 => {
                debug!("🧹 Journal pruned: {events} event(s), {tasks} finished task(s)");
            }
            (Err(e), _) | (_, Err(e)) => warn!("⚠️ Failed to prune journal: {e}"),
            _ => {}
        }
    }

    /// Write the task's current snapshot to the journal, if any.
    fn persist(&self, id: &str) {
        let (Some(db), Some(task)) = (&self.db, self.registry.get(id)) else {
            return;
        };
        if let Err(e) = db.save_task(&task.view()) {
            warn!("⚠️ Failed to persist task {id}: {e}");
        }
    }
}

/// Snapshot of scheduler counters.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub max_concurrent: usize,
    pub scheduler_enabled: bool,
    pub status_counts: BTreeMap<TaskStatus, usize>,
}

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Tasks admitted this tick, in admission order.
    pub admitted: Vec<TaskId>,
    /// Ready tasks left waiting for a free slot.
    pub deferred: usize,
    handles: Vec<JoinHandle<()>>,
}

impl TickReport {
    /// Wait for every run dispatched by this tick to finish and be applied.
    pub async fn wait(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("⚠️ Task worker aborted: {e}");
            }
        }
    }
}

impl Scheduler {
    /// In-memory scheduler on the wall clock.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(config, clock, None)
    }

    /// Scheduler that journals every transition to `db`.
    pub fn with_store(config: SchedulerConfig, clock: Arc<dyn Clock>, db: SchedulerDb) -> Self {
        Self::build(config, clock, Some(db))
    }

    /// Build from config, opening the journal at `config.db_path` if set.
    pub fn open(config: SchedulerConfig) -> Result<Self> {
        match config.db_path.clone() {
            Some(path) => {
                let db = SchedulerDb::open(Path::new(&path))?;
                info!("💾 Task journal: {path}");
                Ok(Self::with_store(config, Arc::new(SystemClock), db))
            }
            None => Ok(Self::new(config)),
        }
    }

    fn build(config: SchedulerConfig, clock: Arc<dyn Clock>, db: Option<SchedulerDb>) -> Self {
        if config.max_concurrent_tasks == 0 {
            warn!("⚠️ max_concurrent_tasks is 0, no task will ever be admitted");
        }
        let slots = Arc::new(Semaphore::new(
            config.max_concurrent_tasks.min(Semaphore::MAX_PERMITS),
        ));
        Self {
            inner: Arc::new(Inner {
                enabled: AtomicBool::new(config.enabled),
                events: EventEmitter::new(config.history_limit),
                recurrence: RecurrencePolicy::new(config.reset_retries_on_recurrence),
                retry: RetryPolicy,
                slots,
                state: Mutex::new(SchedulerState {
                    registry: TaskRegistry::new(),
                    db,
                }),
                clock,
                config,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    // ─── Registry API ──────────────────────────────────────

    /// Submit a task. Never fails; returns the new task's id.
    pub async fn schedule_task(&self, spec: TaskSpec, work: Arc<dyn TaskWork>) -> TaskId {
        let now = self.now();
        let mut state = self.inner.state.lock().await;
        let seq = state.registry.next_seq();
        let task = Task::from_spec(spec, work, seq, now, self.inner.config.default_max_retries);
        let id = task.id.clone();
        let event = SchedulerEvent::TaskScheduled {
            id: id.clone(),
            name: task.name.clone(),
            time: task.scheduled_time,
        };
        info!(
            "📅 Task scheduled: '{}' ({}) priority={} at {}{}",
            task.name,
            id,
            task.priority,
            task.scheduled_time.to_rfc3339(),
            if task.recurring {
                format!(", every {}min", task.interval_minutes)
            } else {
                String::new()
            }
        );
        state.registry.insert(task);
        state.persist(&id);
        self.inner.emit(&state, event);
        id
    }

    /// Cancel a task. Returns `false` for unknown, terminal or
    /// already-cancelling tasks. A running task keeps running; it becomes
    /// `Cancelled` when its current run returns.
    pub async fn cancel_task(&self, id: &str) -> bool {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let Some(task) = state.registry.get_mut(id) else {
            debug!("Cancel ignored, unknown task {id}");
            return false;
        };

        match task.status {
            status if status.is_terminal() => false,
            TaskStatus::Running => {
                if task.cancel_requested {
                    return false;
                }
                task.cancel_requested = true;
                if let Some(token) = &task.cancel {
                    token.cancel();
                }
                info!("🛑 Cancel requested for running task '{}' ({id})", task.name);
                true
            }
            _ => {
                task.status = TaskStatus::Cancelled;
                task.next_run_time = None;
                let event = SchedulerEvent::TaskCancelled {
                    id: id.to_string(),
                    name: task.name.clone(),
                };
                info!("🛑 Task cancelled: '{}' ({id})", task.name);
                state.persist(id);
                self.inner.emit(state, event);
                true
            }
        }
    }

    /// Drop a task record entirely. A running task is signalled to stop and
    /// its result is discarded.
    pub async fn remove_task(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(task) = state.registry.remove(id) else {
            return false;
        };
        if let Some(token) = &task.cancel {
            token.cancel();
        }
        if let Some(db) = &state.db {
            if let Err(e) = db.delete_task(id) {
                warn!("⚠️ Failed to delete task {id} from journal: {e}");
            }
        }
        info!("🗑️ Task removed: '{}' ({id})", task.name);
        true
    }

    pub async fn get_task_status(&self, id: &str) -> Option<TaskStatus> {
        let state = self.inner.state.lock().await;
        state.registry.get(id).map(|t| t.status)
    }

    pub async fn get_task(&self, id: &str) -> Option<TaskView> {
        let state = self.inner.state.lock().await;
        state.registry.get(id).map(Task::view)
    }

    /// All tasks, soonest next run first; tasks with no next run last.
    pub async fn get_scheduled_tasks(&self) -> Vec<TaskView> {
        let state = self.inner.state.lock().await;
        state.registry.views_by_next_run()
    }

    pub async fn get_statistics(&self) -> SchedulerStats {
        let state = self.inner.state.lock().await;
        SchedulerStats {
            total_tasks: state.registry.len(),
            active_tasks: self.inner.in_flight(),
            max_concurrent: self.inner.config.max_concurrent_tasks,
            scheduler_enabled: self.is_enabled(),
            status_counts: state.registry.status_counts(),
        }
    }

    // ─── Pause / resume ──────────────────────────────────────

    pub fn pause_scheduler(&self) {
        if self.inner.enabled.swap(false, Ordering::SeqCst) {
            info!("⏸️ Scheduler paused");
        }
    }

    pub fn resume_scheduler(&self) {
        if !self.inner.enabled.swap(true, Ordering::SeqCst) {
            info!("▶️ Scheduler resumed");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    // ─── Notifications ──────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Recent lifecycle events, oldest first.
    pub fn history(&self) -> Vec<SchedulerEvent> {
        self.inner.events.history()
    }

    // ─── Tick ──────────────────────────────────────

    /// Run one admission cycle at the clock's current time.
    pub async fn tick(&self) -> TickReport {
        self.tick_at(self.now()).await
    }

    /// Admit ready tasks, highest priority first, up to the free slots.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        if !self.is_enabled() {
            debug!("⏸️ Scheduler paused, no admission");
            return report;
        }

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let ready = state.registry.ready(now);
        if ready.is_empty() {
            return report;
        }

        let available = self.inner.slots.available_permits();
        report.deferred = ready.len().saturating_sub(available);

        for id in ready.into_iter().take(available) {
            let Ok(permit) = Arc::clone(&self.inner.slots).try_acquire_owned() else {
                report.deferred += 1;
                continue;
            };
            let Some(task) = state.registry.get_mut(&id) else {
                continue;
            };

            task.status = TaskStatus::Running;
            task.last_run_time = Some(now);
            task.run_count += 1;
            task.cancel_requested = false;
            let token = CancellationToken::new();
            task.cancel = Some(token.clone());

            let ctx = TaskContext {
                task_id: id.clone(),
                task_name: task.name.clone(),
                attempt: task.retry_count + 1,
                metadata: task.metadata.clone(),
                cancel: token,
            };
            let work = Arc::clone(&task.work);
            info!(
                "🔔 Task started: '{}' ({id}) priority={} attempt={}",
                task.name, task.priority, ctx.attempt
            );
            let event = SchedulerEvent::TaskStarted {
                id: id.clone(),
                name: task.name.clone(),
            };

            state.persist(&id);
            self.inner.emit(state, event);

            let inner = Arc::clone(&self.inner);
            report
                .handles
                .push(tokio::spawn(run_job(inner, id.clone(), work, ctx, permit)));
            report.admitted.push(id);
        }

        if report.deferred > 0 {
            debug!(
                "{} ready task(s) waiting for a free slot ({} max)",
                report.deferred, self.inner.config.max_concurrent_tasks
            );
        }
        report
    }

    // ─── Journal ──────────────────────────────────────

    /// Reload unfinished tasks from the journal. `rebind` supplies the work
    /// for each record; records it cannot bind are skipped. Tasks that were
    /// mid-run when the process died come back as `Pending`.
    pub async fn restore<F>(&self, rebind: F) -> Result<usize>
    where
        F: Fn(&TaskView) -> Option<Arc<dyn TaskWork>>,
    {
        let now = self.now();
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let views = match &state.db {
            Some(db) => db.load_tasks()?,
            None => return Ok(0),
        };
        state.prune(self.inner.config.journal_retention);

        let mut restored = 0;
        for mut view in views {
            if view.status.is_terminal() || state.registry.get(&view.id).is_some() {
                continue;
            }
            let Some(work) = rebind(&view) else {
                warn!(
                    "⚠️ No work bound for task '{}' ({}, kind {}), skipping",
                    view.name, view.id, view.kind
                );
                continue;
            };
            if view.status == TaskStatus::Running {
                view.status = TaskStatus::Pending;
            }
            if view.next_run_time.is_none() {
                view.next_run_time = Some(now);
            }
            let id = view.id.clone();
            state.registry.insert(Task::from_view(view, work));
            state.persist(&id);
            restored += 1;
        }

        info!("♻️ Restored {restored} task(s) from journal");
        Ok(restored)
    }

    // ─── Loop ──────────────────────────────────────

    /// Tick every `tick_interval_secs` until `shutdown` fires. Runs already
    /// in flight are left to finish on their own.
    pub async fn run(&self, shutdown: CancellationToken) {
        let secs = self.inner.config.tick_interval_secs.max(1);
        info!(
            "⏰ Scheduler started (tick every {}s, max {} concurrent)",
            secs, self.inner.config.max_concurrent_tasks
        );

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if !report.admitted.is_empty() {
                        debug!("Tick admitted {} task(s)", report.admitted.len());
                    }
                }
            }
        }

        info!("⏹️ Scheduler stopped");
    }
}

/// Spawn the scheduler loop as a background tokio task.
pub fn spawn_scheduler(scheduler: Scheduler, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move { scheduler.run(shutdown).await })
}

/// Executor: run the work, turn panics into failures, then apply the
/// outcome and release the slot together.
async fn run_job(
    inner: Arc<Inner>,
    id: TaskId,
    work: Arc<dyn TaskWork>,
    ctx: TaskContext,
    permit: OwnedSemaphorePermit,
) {
    let result = AssertUnwindSafe(work.execute(ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(panic.as_ref()))));
    inner.finish(&id, result, permit).await;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Inner {
    fn emit(&self, state: &SchedulerState, event: SchedulerEvent) {
        if let Some(db) = &state.db {
            match db.record_event(&event, self.clock.now()) {
                Ok(row) if row % PRUNE_EVERY == 0 => state.prune(self.config.journal_retention),
                Ok(_) => {}
                Err(e) => warn!("⚠️ Failed to journal {}: {e}", event.kind()),
            }
        }
        self.events.emit(event);
    }

    /// Runs currently holding a slot, including runs of removed tasks.
    fn in_flight(&self) -> usize {
        self.config
            .max_concurrent_tasks
            .min(Semaphore::MAX_PERMITS)
            .saturating_sub(self.slots.available_permits())
    }

    /// Apply a finished run to its task. The slot is released while the
    /// state lock is still held, so no tick sees a finished task whose slot
    /// is still taken.
    async fn finish(
        &self,
        id: &str,
        result: std::result::Result<serde_json::Value, TaskError>,
        permit: OwnedSemaphorePermit,
    ) {
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(task) = state.registry.get_mut(id) else {
            debug!("Task {id} was removed while running, result dropped");
            drop(permit);
            return;
        };
        task.cancel = None;
        let name = task.name.clone();

        let event = if task.cancel_requested {
            task.status = TaskStatus::Cancelled;
            task.next_run_time = None;
            info!("🛑 Task cancelled after run: '{name}' ({id})");
            SchedulerEvent::TaskCancelled {
                id: id.to_string(),
                name,
            }
        } else {
            match result {
                Ok(value) => {
                    match self.recurrence.on_success(task, now) {
                        SuccessOutcome::Completed => {
                            info!("✅ Task completed: '{name}' ({id})");
                        }
                        SuccessOutcome::Rescheduled { next_run } => {
                            info!(
                                "✅ Task completed: '{name}' ({id}), next run {}",
                                next_run.to_rfc3339()
                            );
                        }
                    }
                    SchedulerEvent::TaskCompleted {
                        id: id.to_string(),
                        name,
                        result: value,
                    }
                }
                Err(e) => match self.retry.on_failure(task, now, &e.to_string()) {
                    FailureOutcome::Retrying {
                        attempt,
                        next_run,
                        error,
                    } => {
                        warn!(
                            "⚠️ Task '{name}' ({id}) failed: {error}; retry {attempt}/{} at {}",
                            task.max_retries,
                            next_run.to_rfc3339()
                        );
                        SchedulerEvent::TaskRetrying {
                            id: id.to_string(),
                            name,
                            attempt,
                            next_run,
                            error,
                        }
                    }
                    FailureOutcome::Failed { error: err } => {
                        error!(
                            "❌ Task '{name}' ({id}) failed permanently after {} retries: {err}",
                            task.retry_count
                        );
                        SchedulerEvent::TaskFailed {
                            id: id.to_string(),
                            name,
                            error: err,
                        }
                    }
                },
            }
        };

        state.persist(id);
        self.emit(state, event);
        drop(permit);
    }
}
