//! Actions: self-describing processing units run by strategy steps.
//!
//! This module provides:
//! - The [`Action`] trait and its [`ActionDescriptor`]
//! - Parameter schemas with validation and coercion
//! - The [`ActionRegistry`] resolving type names to factories
//! - Built-in actions for loading, reconciling and exporting mappings

pub mod builtin;
mod descriptor;
mod registry;
mod schema;

pub use descriptor::{ActionDescriptor, ContextCapabilities, DatasetRef};
pub use registry::{ActionFactory, ActionRegistry};
pub use schema::{ParamSchema, ParamSpec, ParamType, ValidatedParams};

use async_trait::async_trait;

use crate::context::ScopedContext;
use crate::core::ActionResult;
use crate::errors::ActionError;

/// A processing unit a strategy step runs.
///
/// Actions must fully write their outputs to the context before
/// `execute` returns.
#[async_trait]
pub trait Action: Send + Sync {
    /// Describes parameters and context capabilities.
    fn descriptor(&self) -> ActionDescriptor;

    /// Runs the action against the step's scoped context.
    async fn execute(
        &self,
        params: &ValidatedParams,
        ctx: &mut ScopedContext<'_>,
    ) -> Result<ActionResult, ActionError>;
}
