//! Mock actions for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::actions::{
    Action, ActionDescriptor, ActionFactory, ContextCapabilities, ParamSchema, ParamSpec,
    ParamType, ValidatedParams,
};
use crate::context::{Dataset, ScopedContext};
use crate::core::{ActionResult, StepMetrics};
use crate::errors::ActionError;

/// Call counter shared between a test and the action instances a
/// registry factory creates.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    /// Creates a counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded calls.
    #[must_use]
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Records a call and returns the new count.
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Wraps a cloneable action into a registry factory.
pub fn factory_of<A>(action: A) -> ActionFactory
where
    A: Action + Clone + 'static,
{
    Box::new(move || Box::new(action.clone()))
}

fn ids_schema() -> ParamSchema {
    ParamSchema::new()
        .param(ParamSpec::optional("output_key", ParamType::String))
        .param(ParamSpec::optional("ids", ParamType::StringList).with_default(serde_json::json!([])))
}

fn write_ids(params: &ValidatedParams, ctx: &mut ScopedContext<'_>) -> Result<u64, ActionError> {
    let ids = params.get_string_list("ids").unwrap_or_default();
    let n = ids.len() as u64;
    if let Some(key) = params.get_str("output_key") {
        ctx.write(key, Dataset::Identifiers(ids))?;
    }
    Ok(n)
}

/// An action that succeeds, optionally writing `ids` to `output_key`.
#[derive(Debug, Clone, Default)]
pub struct MockAction {
    calls: CallCounter,
}

impl MockAction {
    /// Creates a mock counting its calls in `calls`.
    #[must_use]
    pub fn with_counter(calls: CallCounter) -> Self {
        Self { calls }
    }
}

#[async_trait]
impl Action for MockAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new("mock", "Succeeds, optionally writing identifiers")
            .with_params(ids_schema())
            .with_capabilities(ContextCapabilities::new().writes_param("output_key"))
    }

    async fn execute(
        &self,
        params: &ValidatedParams,
        ctx: &mut ScopedContext<'_>,
    ) -> Result<ActionResult, ActionError> {
        self.calls.hit();
        let n = write_ids(params, ctx)?;
        Ok(ActionResult::ok(format!("mock wrote {n} ids"))
            .with_metrics(StepMetrics::new().with_processed(n)))
    }
}

/// An action that always fails.
#[derive(Debug, Clone)]
pub struct FailingAction {
    error: ActionError,
    calls: CallCounter,
}

impl Default for FailingAction {
    fn default() -> Self {
        Self::permanent("mock failure")
    }
}

impl FailingAction {
    /// Fails with a non-retryable error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            error: ActionError::permanent(message),
            calls: CallCounter::new(),
        }
    }

    /// Fails with a retryable error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            error: ActionError::transient(message),
            calls: CallCounter::new(),
        }
    }

    /// Counts calls in `calls`.
    #[must_use]
    pub fn with_counter(mut self, calls: CallCounter) -> Self {
        self.calls = calls;
        self
    }
}

#[async_trait]
impl Action for FailingAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new("failing", "Always fails")
    }

    async fn execute(
        &self,
        _params: &ValidatedParams,
        _ctx: &mut ScopedContext<'_>,
    ) -> Result<ActionResult, ActionError> {
        self.calls.hit();
        Err(self.error.clone())
    }
}

/// An action that fails transiently a set number of times, then succeeds.
///
/// It writes its output before failing, so a retry only succeeds if the
/// context was restored in between.
#[derive(Debug, Clone, Default)]
pub struct FlakyAction {
    failures: usize,
    calls: CallCounter,
}

impl FlakyAction {
    /// Fails the first `failures` calls counted in `calls`.
    #[must_use]
    pub fn new(failures: usize, calls: CallCounter) -> Self {
        Self { failures, calls }
    }
}

#[async_trait]
impl Action for FlakyAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new("flaky", "Fails transiently, then succeeds")
            .with_params(ids_schema())
            .with_capabilities(ContextCapabilities::new().writes_param("output_key"))
    }

    async fn execute(
        &self,
        params: &ValidatedParams,
        ctx: &mut ScopedContext<'_>,
    ) -> Result<ActionResult, ActionError> {
        let call = self.calls.hit();
        let n = write_ids(params, ctx)?;
        if call <= self.failures {
            return Err(ActionError::transient(format!("flaky failure {call}")));
        }
        Ok(ActionResult::ok(format!("succeeded on call {call}"))
            .with_metrics(StepMetrics::new().with_processed(n)))
    }
}

/// An action that records the steps it ran in and the sizes of the
/// identifier datasets it read.
#[derive(Debug, Clone, Default)]
pub struct RecordingAction {
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingAction {
    /// Creates a recorder with an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries recorded so far, as `step` or `step:input=len`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Action for RecordingAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new("recording", "Records each call")
            .with_params(ParamSchema::new().param(ParamSpec::optional("input_key", ParamType::String)))
            .with_capabilities(ContextCapabilities::new().reads_param("input_key"))
    }

    async fn execute(
        &self,
        params: &ValidatedParams,
        ctx: &mut ScopedContext<'_>,
    ) -> Result<ActionResult, ActionError> {
        let entry = match params.get_str("input_key") {
            Some(key) => {
                let len = ctx.identifiers(key)?.len();
                format!("{}:{key}={len}", ctx.step())
            }
            None => ctx.step().to_string(),
        };
        self.calls.lock().push(entry);
        Ok(ActionResult::ok("recorded"))
    }
}

/// An action that touches a dataset it never declared.
#[derive(Debug, Clone, Copy, Default)]
pub struct SneakyAction;

#[async_trait]
impl Action for SneakyAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new("sneaky", "Writes an undeclared dataset")
    }

    async fn execute(
        &self,
        _params: &ValidatedParams,
        ctx: &mut ScopedContext<'_>,
    ) -> Result<ActionResult, ActionError> {
        // The error is swallowed on purpose; the violation still fails the step.
        let _ = ctx.write("hidden", Dataset::Identifiers(vec!["x".to_string()]));
        Ok(ActionResult::ok("pretended to succeed"))
    }
}
