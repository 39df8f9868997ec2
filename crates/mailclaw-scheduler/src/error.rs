//! Scheduler errors.
//!
//! Unknown task ids are not errors: the public API reports them as
//! `false`/`None`. Task failures are [`crate::work::TaskError`] and stay
//! inside the retry policy.

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt task record '{id}': {reason}")]
    CorruptRecord { id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
