//! Execution context shared by the steps of a job.
//!
//! This module provides:
//! - Typed datasets keyed by name
//! - The owned, serializable context a job's steps mutate
//! - A per-step scoped view enforcing declared reads and writes

mod dataset;
mod execution;
mod scoped;

pub use dataset::Dataset;
pub use execution::{ExecutionContext, OutputFile};
pub use scoped::{ScopedContext, StepAccess};
