//! Persistence of jobs, steps, checkpoints, logs, results and events.
//!
//! [`JobStore`] is the storage contract; [`InMemoryJobStore`] backs tests
//! and single-process runs, [`SqliteJobStore`] survives restarts.

mod memory;
mod models;
mod sqlite;

pub use memory::InMemoryJobStore;
pub use models::{
    sha256_hex, CheckpointId, CheckpointPayload, ExecutionCheckpoint, ExecutionLog, ExecutionStep,
    Job, JobError, JobEvent, JobId, Payload, ResourceUsage, ResultStorage, SequenceHeads,
    StepCommit,
};
pub use sqlite::SqliteJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::JobStatus;

/// Errors produced by [`JobStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A record could not be (de)serialized.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File-system I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking store task panicked or was cancelled.
    #[error("store task failed: {0}")]
    TaskFailed(String),

    /// A stored value could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// The record to update does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Convenience alias used by store implementations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage contract for job execution state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn JobStore>`.
/// Writes for one job come from a single interpreter; writes for
/// different jobs may interleave.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new job.
    async fn create_job(&self, job: &Job) -> StoreResult<()>;

    /// Replaces an existing job row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the job does not exist.
    async fn update_job(&self, job: &Job) -> StoreResult<()>;

    /// Reads a job. Returns `Ok(None)` when absent.
    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<Job>>;

    /// Lists jobs, optionally filtered by status, oldest first.
    async fn list_jobs(&self, status: Option<JobStatus>) -> StoreResult<Vec<Job>>;

    /// Inserts or replaces the row for `(job_id, step_index)`.
    async fn upsert_step(&self, step: &ExecutionStep) -> StoreResult<()>;

    /// Reads one step row.
    async fn get_step(&self, job_id: JobId, step_index: usize) -> StoreResult<Option<ExecutionStep>>;

    /// Lists the step rows of a job ordered by index.
    async fn list_steps(&self, job_id: JobId) -> StoreResult<Vec<ExecutionStep>>;

    /// Appends log lines.
    async fn append_logs(&self, logs: &[ExecutionLog]) -> StoreResult<()>;

    /// Lists the log lines of a job ordered by sequence.
    async fn list_logs(&self, job_id: JobId) -> StoreResult<Vec<ExecutionLog>>;

    /// Inserts a checkpoint row.
    async fn save_checkpoint(&self, checkpoint: &ExecutionCheckpoint) -> StoreResult<()>;

    /// Lists the checkpoints of a job, oldest first.
    async fn list_checkpoints(&self, job_id: JobId) -> StoreResult<Vec<ExecutionCheckpoint>>;

    /// Lists checkpoints of every job whose expiry is at or before `now`.
    async fn list_expired_checkpoints(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ExecutionCheckpoint>>;

    /// Deletes a checkpoint row. Returns false if it did not exist.
    async fn delete_checkpoint(&self, checkpoint_id: CheckpointId) -> StoreResult<bool>;

    /// Inserts or replaces the result for `(job_id, step_index, result_key)`.
    async fn save_result(&self, result: &ResultStorage) -> StoreResult<()>;

    /// Reads a result and bumps its access counter.
    async fn read_result(
        &self,
        job_id: JobId,
        step_index: usize,
        result_key: &str,
    ) -> StoreResult<Option<ResultStorage>>;

    /// Lists the results of a job ordered by (step, key).
    async fn list_results(&self, job_id: JobId) -> StoreResult<Vec<ResultStorage>>;

    /// Appends events.
    async fn append_events(&self, events: &[JobEvent]) -> StoreResult<()>;

    /// Lists the events of a job with sequence `>= from_sequence`.
    async fn list_events(&self, job_id: JobId, from_sequence: u64) -> StoreResult<Vec<JobEvent>>;

    /// Lists undelivered events across jobs, oldest first.
    async fn pending_events(&self, limit: usize) -> StoreResult<Vec<JobEvent>>;

    /// Marks an event delivered. Returns false if it did not exist.
    async fn mark_event_delivered(&self, event_id: Uuid) -> StoreResult<bool>;

    /// Records a failed delivery attempt. Returns false if it did not exist.
    async fn record_delivery_failure(&self, event_id: Uuid, error: &str) -> StoreResult<bool>;

    /// Persists everything a step produced as one atomic unit.
    async fn commit_step(&self, commit: &StepCommit) -> StoreResult<()>;

    /// Next free log and event sequence numbers of a job.
    async fn sequence_heads(&self, job_id: JobId) -> StoreResult<SequenceHeads>;
}
