//! # Mapflow
//!
//! Strategy execution core for biological identifier mapping pipelines.
//!
//! A strategy is a declarative, linear list of steps. Each step names a
//! registered action and its parameters. Mapflow runs strategies as
//! persistent jobs with:
//!
//! - **Typed datasets**: steps read and write named identifier lists,
//!   mapping tables and reconciliation outputs, checked against each
//!   action's declared capabilities before the first step runs
//! - **Durable progress**: job, step, log and event rows in SQLite, with
//!   checkpoints that let a failed or interrupted job resume
//! - **Bidirectional reconciliation**: forward and reverse mapping tables
//!   merged into validated, canonical, scored records
//! - **Job service**: a bounded worker pool with cancellation and per-job
//!   event streams
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mapflow::prelude::*;
//!
//! let catalog = Arc::new(StrategyCatalog::new());
//! catalog.register(StrategyDefinition::from_yaml_str(STRATEGY_YAML)?);
//!
//! let service = JobService::from_config(
//!     &EngineConfig::default(),
//!     Arc::new(ActionRegistry::with_builtins()),
//!     catalog,
//! )?;
//! let job_id = service.submit("protein_harmonization", BTreeMap::new()).await?;
//! let job = service.wait(job_id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod actions;
pub mod cancellation;
pub mod checkpoint;
pub mod compression;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod interpreter;
pub mod jobs;
pub mod observability;
pub mod reconcile;
pub mod store;
pub mod strategy;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::actions::{
        Action, ActionDescriptor, ActionRegistry, ContextCapabilities, ParamSpec, ParamType,
        ValidatedParams,
    };
    pub use crate::cancellation::CancellationToken;
    pub use crate::checkpoint::{CheckpointManager, CheckpointPolicy};
    pub use crate::config::EngineConfig;
    pub use crate::context::{Dataset, ExecutionContext, ScopedContext};
    pub use crate::core::{ActionResult, JobEventKind, JobStatus, StepMetrics, StepStatus};
    pub use crate::errors::{ActionError, MapflowError, ValidationError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::interpreter::{JobRunner, RetryConfig, StartPoint};
    pub use crate::jobs::JobService;
    pub use crate::reconcile::{
        BidirectionalReconciler, MappingRow, MappingTable, ReconcileRequest, ReconciliationOutput,
    };
    pub use crate::store::{InMemoryJobStore, Job, JobId, JobStore, SqliteJobStore};
    pub use crate::strategy::{StepDefinition, StrategyCatalog, StrategyDefinition};
}
