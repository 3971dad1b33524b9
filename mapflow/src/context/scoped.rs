//! Capability-checked view of the execution context for one step.

use std::collections::BTreeSet;

use super::{Dataset, ExecutionContext, OutputFile};
use crate::errors::{ActionError, DataConflictError, MapflowError, UndeclaredAccessError};
use crate::reconcile::{MappingTable, ReconciliationOutput};

/// Dataset keys a step may touch, resolved from its action's
/// capabilities and its parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepAccess {
    /// Step name, for error messages.
    pub step: String,
    /// Keys the step reads.
    pub reads: BTreeSet<String>,
    /// Keys the step creates.
    pub writes: BTreeSet<String>,
    /// Keys the step may replace.
    pub overwrites: BTreeSet<String>,
}

impl StepAccess {
    /// Creates an empty access set for a step.
    #[must_use]
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            ..Self::default()
        }
    }

    /// Adds a read key.
    #[must_use]
    pub fn reading(mut self, key: impl Into<String>) -> Self {
        self.reads.insert(key.into());
        self
    }

    /// Adds a write key.
    #[must_use]
    pub fn writing(mut self, key: impl Into<String>) -> Self {
        self.writes.insert(key.into());
        self
    }

    /// Adds an overwrite key.
    #[must_use]
    pub fn overwriting(mut self, key: impl Into<String>) -> Self {
        self.overwrites.insert(key.into());
        self
    }

    fn may_read(&self, key: &str) -> bool {
        self.reads.contains(key) || self.overwrites.contains(key)
    }

    fn may_write(&self, key: &str) -> bool {
        self.writes.contains(key) || self.overwrites.contains(key)
    }
}

/// The only handle an action gets on the execution context.
///
/// Accesses outside the declared [`StepAccess`] fail, and the first such
/// violation is kept so the interpreter fails the step with it even if
/// the action swallows the error.
#[derive(Debug)]
pub struct ScopedContext<'a> {
    ctx: &'a mut ExecutionContext,
    access: &'a StepAccess,
    violation: Option<MapflowError>,
}

impl<'a> ScopedContext<'a> {
    /// Wraps a context for one step.
    pub fn new(ctx: &'a mut ExecutionContext, access: &'a StepAccess) -> Self {
        Self {
            ctx,
            access,
            violation: None,
        }
    }

    /// Name of the running step.
    #[must_use]
    pub fn step(&self) -> &str {
        &self.access.step
    }

    fn violate(&mut self, error: MapflowError) -> ActionError {
        let action_error = ActionError::permanent(error.to_string());
        if self.violation.is_none() {
            self.violation = Some(error);
        }
        action_error
    }

    /// Returns true if a declared, readable key holds a dataset.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.access.may_read(key) && self.ctx.contains(key)
    }

    /// Reads a declared dataset.
    pub fn read(&mut self, key: &str) -> Result<&Dataset, ActionError> {
        if !self.access.may_read(key) {
            let err = UndeclaredAccessError::read(self.access.step.clone(), key);
            return Err(self.violate(err.into()));
        }
        self.ctx
            .get(key)
            .ok_or_else(|| ActionError::permanent(format!("dataset '{key}' does not exist")))
    }

    /// Reads a declared identifier list.
    pub fn identifiers(&mut self, key: &str) -> Result<&[String], ActionError> {
        let dataset = self.read(key)?;
        dataset
            .as_identifiers()
            .ok_or_else(|| type_mismatch(key, "identifiers", dataset))
    }

    /// Reads a declared mapping table.
    pub fn mappings(&mut self, key: &str) -> Result<&MappingTable, ActionError> {
        let dataset = self.read(key)?;
        dataset
            .as_mappings()
            .ok_or_else(|| type_mismatch(key, "mappings", dataset))
    }

    /// Reads a declared reconciliation output.
    pub fn reconciled(&mut self, key: &str) -> Result<&ReconciliationOutput, ActionError> {
        let dataset = self.read(key)?;
        dataset
            .as_reconciled()
            .ok_or_else(|| type_mismatch(key, "reconciled", dataset))
    }

    /// Writes a declared dataset.
    ///
    /// Keys declared as overwrites replace any existing value; keys
    /// declared as plain writes must not exist yet.
    pub fn write(&mut self, key: &str, dataset: Dataset) -> Result<(), ActionError> {
        if !self.access.may_write(key) {
            let err = UndeclaredAccessError::write(self.access.step.clone(), key);
            return Err(self.violate(err.into()));
        }
        if self.access.overwrites.contains(key) {
            self.ctx.put_overwrite(key, dataset);
            return Ok(());
        }
        if self.ctx.contains(key) {
            return Err(self.violate(DataConflictError::new(key).into()));
        }
        self.ctx.put_overwrite(key, dataset);
        Ok(())
    }

    /// Records a statistic under `<step>.<key>`.
    pub fn record_statistic(&mut self, key: &str, value: serde_json::Value) {
        let full_key = format!("{}.{key}", self.access.step);
        self.ctx.record_statistic(full_key, value);
    }

    /// Records an output file.
    pub fn add_output_file(&mut self, file: OutputFile) {
        self.ctx.add_output_file(file);
    }

    /// Takes the first access violation, if any.
    pub fn take_violation(&mut self) -> Option<MapflowError> {
        self.violation.take()
    }
}

fn type_mismatch(key: &str, expected: &str, found: &Dataset) -> ActionError {
    ActionError::permanent(format!(
        "dataset '{key}' holds {}, expected {expected}",
        found.kind()
    ))
}
