//! Core types shared across the execution engine.

mod result;
mod status;

pub use result::{ActionResult, ResultArtifact, StepMetrics};
pub use status::{CheckpointKind, JobEventKind, JobStatus, LogLevel, StepStatus};
