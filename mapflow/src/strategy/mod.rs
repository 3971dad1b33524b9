//! Strategies: declarative, linear pipelines of action steps.
//!
//! This module provides:
//! - Strategy and step definitions loaded from YAML or JSON
//! - `${...}` placeholder resolution against parameters and datasets
//! - Load-time validation producing a [`StrategyPlan`]
//! - A catalog of named strategies

mod catalog;
mod definition;
mod template;
mod validate;

pub use catalog::StrategyCatalog;
pub use definition::{StepDefinition, StrategyDefinition};
pub use template::{has_dataset_references, references, Reference, TemplateError, TemplateResolver};
pub use validate::{validate_strategy, PlannedStep, StrategyPlan};
