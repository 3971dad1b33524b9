//! Job, step, checkpoint, log and event status enums.
//!
//! Job and step statuses form the state machines that the interpreter
//! drives; every transition goes through `can_transition_to`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::MapflowError;

/// Lifecycle status of a job.
///
/// `Pending -> Running -> {Completed, Failed, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, not yet claimed by an interpreter.
    #[default]
    Pending,
    /// Claimed and executing steps.
    Running,
    /// Every required step completed.
    Completed,
    /// A required step failed, or the strategy failed to load.
    Failed,
    /// Cancelled cooperatively between steps.
    Cancelled,
}

impl JobStatus {
    /// All variants, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Returns true if no further transitions are possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the state machine allows moving to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }

    /// Checks a transition, returning an error if it is not allowed.
    pub fn check_transition(&self, next: Self) -> Result<(), MapflowError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(MapflowError::invalid_transition(self, next))
        }
    }

    /// Stable string form used in persistence.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step within a job.
///
/// `Pending -> Running -> {Completed, Failed, Skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started.
    #[default]
    Pending,
    /// Executing (possibly on a retry attempt).
    Running,
    /// Finished successfully.
    Completed,
    /// A required step failed; the job halts.
    Failed,
    /// An optional step failed; the error is recorded and the job continues.
    Skipped,
}

impl StepStatus {
    /// All variants, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Skipped,
    ];

    /// Returns true if the step reached a final state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Returns true if the state machine allows moving to `next`.
    ///
    /// A terminal step may be moved back to `Running` only by a resume,
    /// which re-executes it in place; see [`StepStatus::can_reopen`].
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed | Self::Failed | Self::Skipped)
        )
    }

    /// Returns true if a resume may re-run a step in this state.
    #[must_use]
    pub fn can_reopen(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Failed)
    }

    /// Stable string form used in persistence.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Taken by the engine outside the step cycle.
    Automatic,
    /// Requested explicitly by a caller.
    Manual,
    /// Taken right before a step runs.
    PreStep,
    /// Taken right after a step finished (completed or skipped).
    PostStep,
    /// Taken after a step failed, with the pre-step state.
    OnError,
}

impl CheckpointKind {
    /// Stable string form used in persistence.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
            Self::PreStep => "pre_step",
            Self::PostStep => "post_step",
            Self::OnError => "on_error",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        [
            Self::Automatic,
            Self::Manual,
            Self::PreStep,
            Self::PostStep,
            Self::OnError,
        ]
        .into_iter()
        .find(|k| k.as_str() == value)
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Normal lifecycle messages.
    Info,
    /// Recoverable problems (skipped optional steps, retries).
    Warning,
    /// Failures.
    Error,
}

impl LogLevel {
    /// Stable string form used in persistence.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        [Self::Debug, Self::Info, Self::Warning, Self::Error]
            .into_iter()
            .find(|l| l.as_str() == value)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a job monitoring event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    /// A step finished and progress advanced.
    Progress,
    /// The job status changed.
    StatusChange,
    /// A step or checkpoint error occurred.
    Error,
    /// A checkpoint was written.
    Checkpoint,
    /// The job reached a terminal status. Always the last event of a run.
    Complete,
}

impl JobEventKind {
    /// Stable string form used in persistence.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::StatusChange => "status_change",
            Self::Error => "error",
            Self::Checkpoint => "checkpoint",
            Self::Complete => "complete",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        [
            Self::Progress,
            Self::StatusChange,
            Self::Error,
            Self::Checkpoint,
            Self::Complete,
        ]
        .into_iter()
        .find(|k| k.as_str() == value)
    }
}

impl fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
