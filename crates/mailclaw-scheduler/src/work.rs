//! Unit-of-work interface: what a task actually runs.
//!
//! The scheduler never knows what a task does (mail fetch, categorization,
//! report export). It only calls [`TaskWork::execute`] and looks at the result.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::tasks::{Metadata, TaskId};

/// Error returned by a task body.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),
    #[error("cancelled")]
    Cancelled,
    #[error("panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        TaskError::Failed(msg.into())
    }
}

/// Per-run context handed to the work.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_name: String,
    /// 1 for the first run of a cycle, 2 for the first retry, ...
    pub attempt: u32,
    pub metadata: Metadata,
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// Whether the task was cancelled while this run was in flight.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// A schedulable unit of work.
#[async_trait]
pub trait TaskWork: Send + Sync {
    /// Run once. The returned value is attached to the completion event.
    async fn execute(&self, ctx: TaskContext) -> Result<serde_json::Value, TaskError>;
}

/// Adapts an async closure into [`TaskWork`].
pub struct FnWork<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnWork<F, Fut>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> TaskWork for FnWork<F, Fut>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
{
    async fn execute(&self, ctx: TaskContext) -> Result<serde_json::Value, TaskError> {
        (self.f)(ctx).await
    }
}
