//! Mail jobs: recurring scans and batch processing on top of the scheduler.
//!
//! The scanner and the batch processor live outside this crate; they are
//! wrapped into [`TaskWork`] adapters so the engine never sees them. Each job
//! writes its parameters into task metadata, which is what [`JobBinder`]
//! reads back when tasks are restored from the journal.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::engine::Scheduler;
use crate::tasks::{Metadata, TaskId, TaskPriority, TaskSpec, TaskView};
use crate::work::{TaskContext, TaskError, TaskWork};

pub const KIND_RECURRING_SCAN: &str = "recurring_scan";
pub const KIND_BATCH_PROCESSING: &str = "batch_processing";

/// Parameters of a recurring mailbox scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub interval_hours: u32,
    #[serde(default)]
    pub query_params: Metadata,
}

impl ScanRequest {
    fn to_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("start_date".into(), self.start_date.to_rfc3339().into());
        meta.insert("end_date".into(), self.end_date.to_rfc3339().into());
        meta.insert("interval_hours".into(), self.interval_hours.into());
        meta.insert("query_params".into(), Value::Object(self.query_params.clone()));
        meta
    }

    /// Rebuild a request from task metadata.
    pub fn from_metadata(meta: &Metadata) -> Option<Self> {
        let date = |key: &str| {
            meta.get(key)?
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc))
        };
        Some(Self {
            start_date: date("start_date")?,
            end_date: date("end_date")?,
            interval_hours: u32::try_from(meta.get("interval_hours")?.as_u64()?).ok()?,
            query_params: meta
                .get("query_params")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

/// Parameters of a recurring batch-processing job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub batch_size: usize,
    pub interval_minutes: u32,
    #[serde(default)]
    pub priority: TaskPriority,
}

impl BatchRequest {
    pub fn from_metadata(meta: &Metadata, priority: TaskPriority) -> Option<Self> {
        Some(Self {
            batch_size: usize::try_from(meta.get("batch_size")?.as_u64()?).ok()?,
            interval_minutes: u32::try_from(meta.get("interval_minutes")?.as_u64()?).ok()?,
            priority,
        })
    }
}

/// Scans a mailbox for one request. Implemented by the mail layer.
#[async_trait]
pub trait MailScanner: Send + Sync {
    async fn scan(&self, request: &ScanRequest, ctx: TaskContext) -> Result<Value, TaskError>;
}

/// Processes up to `batch_size` queued items. Implemented by the mail layer.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(&self, batch_size: usize, ctx: TaskContext) -> Result<Value, TaskError>;
}

struct ScanWork {
    request: ScanRequest,
    scanner: Arc<dyn MailScanner>,
}

#[async_trait]
impl TaskWork for ScanWork {
    async fn execute(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        self.scanner.scan(&self.request, ctx).await
    }
}

struct BatchWork {
    batch_size: usize,
    processor: Arc<dyn BatchProcessor>,
}

#[async_trait]
impl TaskWork for BatchWork {
    async fn execute(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        self.processor.process_batch(self.batch_size, ctx).await
    }
}

impl Scheduler {
    /// Scan `[start_date, end_date]` now and then every `interval_hours`.
    pub async fn schedule_recurring_scan(
        &self,
        request: ScanRequest,
        scanner: Arc<dyn MailScanner>,
    ) -> TaskId {
        let mut spec = TaskSpec::new(&format!(
            "Email scan {}..{}",
            request.start_date.date_naive(),
            request.end_date.date_naive()
        ))
        .description(&format!("Scan mail every {}h", request.interval_hours))
        .every_minutes(request.interval_hours.saturating_mul(60))
        .kind(KIND_RECURRING_SCAN);
        for (key, value) in request.to_metadata() {
            spec = spec.metadata(&key, value);
        }

        let id = self
            .schedule_task(spec, Arc::new(ScanWork { request, scanner }))
            .await;
        info!("📬 Recurring scan scheduled: {id}");
        id
    }

    /// Process a batch of `batch_size` now and then every `interval_minutes`.
    pub async fn schedule_batch_processing(
        &self,
        request: BatchRequest,
        processor: Arc<dyn BatchProcessor>,
    ) -> TaskId {
        let spec = TaskSpec::new(&format!("Batch processing ({} items)", request.batch_size))
            .priority(request.priority)
            .every_minutes(request.interval_minutes)
            .kind(KIND_BATCH_PROCESSING)
            .metadata("batch_size", request.batch_size)
            .metadata("interval_minutes", request.interval_minutes);

        let work = BatchWork {
            batch_size: request.batch_size,
            processor,
        };
        let id = self.schedule_task(spec, Arc::new(work)).await;
        info!("📦 Batch processing scheduled: {id}");
        id
    }
}

/// Re-attaches mail job work to journaled tasks, for [`Scheduler::restore`].
#[derive(Default, Clone)]
pub struct JobBinder {
    scanner: Option<Arc<dyn MailScanner>>,
    processor: Option<Arc<dyn BatchProcessor>>,
}

impl JobBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scanner(mut self, scanner: Arc<dyn MailScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn BatchProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn rebind(&self, view: &TaskView) -> Option<Arc<dyn TaskWork>> {
        match view.kind.as_str() {
            KIND_RECURRING_SCAN => {
                let scanner = Arc::clone(self.scanner.as_ref()?);
                let request = ScanRequest::from_metadata(&view.metadata)?;
                Some(Arc::new(ScanWork { request, scanner }))
            }
            KIND_BATCH_PROCESSING => {
                let processor = Arc::clone(self.processor.as_ref()?);
                let request = BatchRequest::from_metadata(&view.metadata, view.priority)?;
                Some(Arc::new(BatchWork {
                    batch_size: request.batch_size,
                    processor,
                }))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::tasks::TaskStatus;
    use chrono::{Duration, TimeZone};
    use mailclaw_core::SchedulerConfig;
    use std::sync::Mutex;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[derive(Default)]
    struct RecordingScanner {
        seen: Mutex<Vec<(ScanRequest, u32)>>,
    }

    #[async_trait]
    impl MailScanner for RecordingScanner {
        async fn scan(&self, request: &ScanRequest, ctx: TaskContext) -> Result<Value, TaskError> {
            self.seen.lock().unwrap().push((request.clone(), ctx.attempt));
            Ok(serde_json::json!({ "messages": 12 }))
        }
    }

    #[derive(Default)]
    struct RecordingProcessor {
        sizes: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl BatchProcessor for RecordingProcessor {
        async fn process_batch(&self, batch_size: usize, _ctx: TaskContext) -> Result<Value, TaskError> {
            self.sizes.lock().unwrap().push(batch_size);
            Ok(Value::Null)
        }
    }

    fn scan_request() -> ScanRequest {
        let mut query_params = Metadata::new();
        query_params.insert("folder".into(), "INBOX".into());
        ScanRequest {
            start_date: t0() - Duration::days(7),
            end_date: t0(),
            interval_hours: 2,
            query_params,
        }
    }

    #[tokio::test]
    async fn test_recurring_scan_runs_every_interval() {
        let clock = Arc::new(ManualClock::new(t0()));
        let s = Scheduler::with_clock(SchedulerConfig::default(), clock.clone());
        let scanner = Arc::new(RecordingScanner::default());
        let id = s
            .schedule_recurring_scan(scan_request(), scanner.clone())
            .await;

        let view = s.get_task(&id).await.unwrap();
        assert!(view.recurring);
        assert_eq!(view.interval_minutes, 120);
        assert_eq!(view.kind, KIND_RECURRING_SCAN);
        assert_eq!(view.metadata["interval_hours"], 2);

        s.tick().await.wait().await;
        clock.advance(Duration::hours(2));
        s.tick().await.wait().await;

        let seen = scanner.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, scan_request());
        assert_eq!(seen[0].1, 1);
        assert_eq!(
            s.get_task(&id).await.unwrap().next_run_time,
            Some(t0() + Duration::hours(4))
        );
    }

    #[tokio::test]
    async fn test_batch_processing_uses_priority() {
        let clock = Arc::new(ManualClock::new(t0()));
        let s = Scheduler::with_clock(SchedulerConfig::default(), clock);
        let processor = Arc::new(RecordingProcessor::default());
        let request = BatchRequest {
            batch_size: 50,
            interval_minutes: 15,
            priority: TaskPriority::High,
        };
        let id = s
            .schedule_batch_processing(request, processor.clone())
            .await;

        let view = s.get_task(&id).await.unwrap();
        assert_eq!(view.priority, TaskPriority::High);
        assert_eq!(view.kind, KIND_BATCH_PROCESSING);

        s.tick().await.wait().await;
        assert_eq!(*processor.sizes.lock().unwrap(), vec![50]);
        assert_eq!(s.get_task_status(&id).await, Some(TaskStatus::Scheduled));
    }

    #[tokio::test]
    async fn test_binder_rebuilds_work_from_metadata() {
        let clock = Arc::new(ManualClock::new(t0()));
        let s = Scheduler::with_clock(SchedulerConfig::default(), clock);
        let scanner = Arc::new(RecordingScanner::default());
        let processor = Arc::new(RecordingProcessor::default());
        let scan_id = s
            .schedule_recurring_scan(scan_request(), scanner.clone())
            .await;
        let batch_id = s
            .schedule_batch_processing(
                BatchRequest {
                    batch_size: 10,
                    interval_minutes: 5,
                    priority: TaskPriority::Low,
                },
                processor.clone(),
            )
            .await;

        let scan_view = s.get_task(&scan_id).await.unwrap();
        assert_eq!(ScanRequest::from_metadata(&scan_view.metadata), Some(scan_request()));
        let batch_view = s.get_task(&batch_id).await.unwrap();

        let binder = JobBinder::new().scanner(scanner).processor(processor.clone());
        assert!(binder.rebind(&scan_view).is_some());
        let work = binder.rebind(&batch_view).unwrap();
        let ctx = TaskContext {
            task_id: batch_id.clone(),
            task_name: batch_view.name.clone(),
            attempt: 1,
            metadata: batch_view.metadata.clone(),
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        work.execute(ctx).await.unwrap();
        assert_eq!(*processor.sizes.lock().unwrap(), vec![10]);

        // Missing collaborator or unknown kind: nothing to bind.
        assert!(JobBinder::new().rebind(&scan_view).is_none());
        let mut custom = scan_view.clone();
        custom.kind = "custom".into();
        assert!(binder.rebind(&custom).is_none());
    }
}
