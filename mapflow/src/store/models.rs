//! Persisted records.
//!
//! Every record here is what a status query or a resume sees; the
//! interpreter's in-memory state is never consulted by readers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::core::{CheckpointKind, JobEventKind, JobStatus, LogLevel, StepMetrics, StepStatus};
use crate::errors::MapflowError;

/// Identifier of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(Uuid);

impl CheckpointId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CheckpointId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Structured failure recorded on a failed job.
///
/// `detail` names the step and error class only; dataset contents never
/// end up here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Human readable message.
    pub message: String,
    /// Step name, index, action type and error kind.
    pub detail: serde_json::Value,
    /// Optional error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Resource counters accumulated over the life of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Sum of `records_processed` over completed steps.
    pub records_processed: u64,
    /// Checkpoints successfully written.
    pub checkpoints_written: u64,
    /// Serialized bytes of those checkpoints, before compression.
    pub bytes_checkpointed: u64,
}

/// A strategy run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Identifier.
    pub id: JobId,
    /// Name of the strategy being run.
    pub strategy_name: String,
    /// Version of the strategy being run.
    pub strategy_version: String,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// When an interpreter first claimed the job.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
    /// Index of the next step to run. Equals `total_steps` once all ran.
    pub current_step_index: usize,
    /// Number of steps in the strategy.
    pub total_steps: usize,
    /// Strategy defaults overlaid with submitted parameters.
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Dataset keys present before the first step ran.
    #[serde(default)]
    pub initial_datasets: Vec<String>,
    /// Reference to the final results (dataset keys and result keys).
    pub results: Option<serde_json::Value>,
    /// Failure, for failed jobs.
    pub error: Option<JobError>,
    /// Resource counters.
    pub resource_usage: ResourceUsage,
    /// How many times the job may be resumed after failing.
    pub max_retries: u32,
    /// How many times the job has been resumed after failing.
    pub retry_count: u32,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Free-form description.
    pub description: Option<String>,
}

impl Job {
    /// Creates a pending job.
    #[must_use]
    pub fn new(
        strategy_name: impl Into<String>,
        strategy_version: impl Into<String>,
        total_steps: usize,
        parameters: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            strategy_name: strategy_name.into(),
            strategy_version: strategy_version.into(),
            status: JobStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            current_step_index: 0,
            total_steps,
            parameters,
            initial_datasets: Vec::new(),
            results: None,
            error: None,
            resource_usage: ResourceUsage::default(),
            max_retries: 0,
            retry_count: 0,
            tags: Vec::new(),
            description: None,
        }
    }

    /// Sets the job-level retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Records the dataset keys the job starts with.
    #[must_use]
    pub fn with_initial_datasets(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.initial_datasets = keys.into_iter().collect();
        self
    }

    /// Sets the tags.
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Moves the job to `next`, stamping the relevant timestamps.
    pub fn transition_to(&mut self, next: JobStatus) -> Result<(), MapflowError> {
        self.status.check_transition(next)?;
        let now = Utc::now();
        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Reopens a failed or cancelled job for a resume.
    ///
    /// This is the one sanctioned way out of a terminal status; it spends
    /// one unit of the job-level retry budget.
    pub fn reopen(&mut self) -> Result<(), MapflowError> {
        if !matches!(self.status, JobStatus::Failed | JobStatus::Cancelled)
            || self.retry_count >= self.max_retries
        {
            return Err(MapflowError::invalid_transition(self.status, JobStatus::Running));
        }
        self.retry_count += 1;
        self.status = JobStatus::Running;
        self.completed_at = None;
        self.error = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Advances progress, keeping `current_step_index <= total_steps`.
    pub fn set_progress(&mut self, next_step_index: usize) {
        self.current_step_index = next_step_index.min(self.total_steps);
        self.updated_at = Utc::now();
    }

    /// Fraction of steps done, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        if self.total_steps == 0 {
            1.0
        } else {
            self.current_step_index as f64 / self.total_steps as f64
        }
    }
}

/// The persisted record of one step of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Owning job.
    pub job_id: JobId,
    /// Position in the strategy.
    pub step_index: usize,
    /// Step name.
    pub step_name: String,
    /// Action type.
    pub action_type: String,
    /// Status.
    pub status: StepStatus,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall time of the last run, in milliseconds.
    pub duration_ms: Option<u64>,
    /// Parameters after template resolution and schema validation.
    pub params: serde_json::Value,
    /// The action's message and data summary.
    pub output_summary: Option<serde_json::Value>,
    /// Error message of the last failed attempt.
    pub error: Option<String>,
    /// Error class of the last failed attempt.
    pub error_kind: Option<String>,
    /// Attempts beyond the first, accumulated across resumes.
    pub retry_count: u32,
    /// Whether the last error may succeed on retry.
    pub can_retry: bool,
    /// Counters reported by the action.
    pub metrics: StepMetrics,
}

impl ExecutionStep {
    /// Creates a pending step row.
    #[must_use]
    pub fn new(
        job_id: JobId,
        step_index: usize,
        step_name: impl Into<String>,
        action_type: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            step_index,
            step_name: step_name.into(),
            action_type: action_type.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            params: serde_json::Value::Null,
            output_summary: None,
            error: None,
            error_kind: None,
            retry_count: 0,
            can_retry: false,
            metrics: StepMetrics::default(),
        }
    }

    /// Moves the step to `next`.
    pub fn transition_to(&mut self, next: StepStatus) -> Result<(), MapflowError> {
        if !self.status.can_transition_to(next) {
            return Err(MapflowError::invalid_transition(self.status, next));
        }
        let now = Utc::now();
        if next == StepStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Puts a previously attempted step back to `Pending` for a resume.
    pub fn reopen(&mut self) -> Result<(), MapflowError> {
        if !self.status.can_reopen() {
            return Err(MapflowError::invalid_transition(self.status, StepStatus::Pending));
        }
        self.status = StepStatus::Pending;
        self.completed_at = None;
        Ok(())
    }
}

/// Snapshot payload: stored inline or behind a pointer into a blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "storage", rename_all = "snake_case")]
pub enum Payload {
    /// Bytes stored in the row itself.
    Inline {
        /// The serialized bytes.
        bytes: Vec<u8>,
    },
    /// Bytes stored externally.
    External {
        /// Blob store location.
        location: String,
        /// Stored size (after compression, if any).
        size_bytes: u64,
        /// Whether the stored bytes are zstd-compressed.
        compressed: bool,
    },
}

/// Payload of a checkpoint row.
pub type CheckpointPayload = Payload;

impl Payload {
    /// Returns the external location, if any.
    #[must_use]
    pub fn location(&self) -> Option<&str> {
        match self {
            Self::Inline { .. } => None,
            Self::External { location, .. } => Some(location),
        }
    }

    /// Stored size in bytes.
    #[must_use]
    pub fn stored_size(&self) -> u64 {
        match self {
            Self::Inline { bytes } => bytes.len() as u64,
            Self::External { size_bytes, .. } => *size_bytes,
        }
    }
}

/// A persisted execution context snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCheckpoint {
    /// Identifier.
    pub id: CheckpointId,
    /// Owning job.
    pub job_id: JobId,
    /// Index of the next step to run when resuming from this snapshot.
    pub step_index: usize,
    /// Why the snapshot was taken.
    pub kind: CheckpointKind,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// After this instant the checkpoint may be pruned.
    pub expires_at: Option<DateTime<Utc>>,
    /// The snapshot.
    pub payload: CheckpointPayload,
    /// Uncompressed serialized size.
    pub size_bytes: u64,
    /// Whether the snapshot can seed a resume.
    pub is_resumable: bool,
}

/// An append-only log line of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    /// Owning job.
    pub job_id: JobId,
    /// Strictly increasing per job, in execution order.
    pub sequence: u64,
    /// Severity.
    pub level: LogLevel,
    /// Message.
    pub message: String,
    /// Structured detail.
    pub detail: Option<serde_json::Value>,
    /// Step the line refers to.
    pub step_index: Option<usize>,
    /// Category, e.g. "step" or "checkpoint".
    pub category: String,
    /// Emitting component, e.g. "interpreter".
    pub component: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

/// A named result artifact produced by a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultStorage {
    /// Owning job.
    pub job_id: JobId,
    /// Producing step.
    pub step_index: usize,
    /// Key, unique per (job, step).
    pub result_key: String,
    /// The stored bytes.
    pub payload: Payload,
    /// MIME type.
    pub content_type: String,
    /// Byte encoding of the payload, e.g. "json" or "zstd+json".
    pub encoding: String,
    /// Hex SHA-256 of the uncompressed bytes.
    pub checksum: String,
    /// Uncompressed size.
    pub size_bytes: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// After this instant the result may be discarded.
    pub expires_at: Option<DateTime<Utc>>,
    /// Reads through the store.
    pub access_count: u64,
    /// Last read through the store.
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl ResultStorage {
    /// Creates an inline JSON result.
    #[must_use]
    pub fn inline_json(
        job_id: JobId,
        step_index: usize,
        result_key: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            job_id,
            step_index,
            result_key: result_key.into(),
            checksum: sha256_hex(&bytes),
            size_bytes: bytes.len() as u64,
            payload: Payload::Inline { bytes },
            content_type: content_type.into(),
            encoding: "json".to_string(),
            created_at: Utc::now(),
            expires_at: None,
            access_count: 0,
            last_accessed_at: None,
        }
    }

    /// Returns true if `bytes` match the stored checksum.
    #[must_use]
    pub fn verify(&self, bytes: &[u8]) -> bool {
        sha256_hex(bytes) == self.checksum
    }
}

/// Hex encoded SHA-256 digest.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A monitoring event of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Identifier.
    pub id: Uuid,
    /// Owning job.
    pub job_id: JobId,
    /// Strictly increasing per job.
    pub sequence: u64,
    /// Kind.
    pub kind: JobEventKind,
    /// Kind specific payload.
    pub payload: serde_json::Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Whether a notifier delivered the event.
    pub delivered: bool,
    /// Delivery attempts made.
    pub attempts: u32,
    /// Error of the last failed delivery.
    pub last_error: Option<String>,
}

impl JobEvent {
    /// Creates an undelivered event.
    #[must_use]
    pub fn new(job_id: JobId, sequence: u64, kind: JobEventKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            sequence,
            kind,
            payload,
            created_at: Utc::now(),
            delivered: false,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Everything one step produces, persisted atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCommit {
    /// Job row with updated progress, status and counters.
    pub job: Job,
    /// The step row.
    pub step: ExecutionStep,
    /// Log lines emitted while running the step.
    pub logs: Vec<ExecutionLog>,
    /// Events emitted while running the step.
    pub events: Vec<JobEvent>,
    /// Post-step or on-error checkpoint, if one was taken.
    pub checkpoint: Option<ExecutionCheckpoint>,
    /// Result artifacts produced by the step.
    pub results: Vec<ResultStorage>,
}

/// Next free log and event sequence numbers of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceHeads {
    /// Next log sequence.
    pub next_log: u64,
    /// Next event sequence.
    pub next_event: u64,
}
