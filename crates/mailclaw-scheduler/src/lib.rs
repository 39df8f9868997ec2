//! # MailClaw Scheduler
//!
//! Priority task scheduler for background mail jobs: recurring mailbox
//! scans, batch processing and one-off exports.
//!
//! ## Design Principles
//! - Bounded concurrency: a semaphore caps in-flight runs
//! - Ticks only admit and dispatch, so a slow job never stalls the loop
//! - Exponential backoff on failure, fixed-interval recurrence on success
//! - Optional SQLite journal, restored on startup
//!
//! ## Architecture
//! ```text
//! Scheduler (tokio interval)
//!   ├── tick → TaskRegistry::ready(now)   priority desc, submission order
//!   │          └── admit up to free slots → tokio::spawn(run_job)
//!   ├── run_job → TaskWork::execute(ctx)  panics caught as failures
//!   │          └── finish → RetryPolicy / RecurrencePolicy
//!   ├── EventEmitter → broadcast + history ring
//!   └── SchedulerDb (optional) → tasks + events journal
//!
//! Jobs
//!   ├── schedule_recurring_scan   → MailScanner
//!   └── schedule_batch_processing → BatchProcessor
//! ```

pub mod clock;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod notify;
pub mod persistence;
pub mod policy;
pub mod registry;
pub mod tasks;
pub mod work;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Scheduler, SchedulerStats, TickReport, spawn_scheduler};
pub use error::{Result, SchedulerError};
pub use jobs::{BatchProcessor, BatchRequest, JobBinder, MailScanner, ScanRequest};
pub use notify::{EventEmitter, SchedulerEvent};
pub use persistence::SchedulerDb;
pub use policy::{FailureOutcome, RecurrencePolicy, RetryPolicy, SuccessOutcome};
pub use tasks::{Metadata, Task, TaskId, TaskPriority, TaskSpec, TaskStatus, TaskView};
pub use work::{FnWork, TaskContext, TaskError, TaskWork};
