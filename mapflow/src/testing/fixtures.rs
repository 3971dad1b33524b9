//! Test fixtures: an in-memory engine and sample strategies.

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::actions::ActionRegistry;
use crate::cancellation::CancellationToken;
use crate::checkpoint::{CheckpointManager, CheckpointPolicy, InMemoryContextStore};
use crate::context::ExecutionContext;
use crate::errors::MapflowError;
use crate::events::CollectingEventSink;
use crate::interpreter::{JobOutcome, JobRunner, RetryConfig, StartPoint};
use crate::store::{InMemoryJobStore, Job, JobStore};
use crate::strategy::{StepDefinition, StrategyDefinition};

/// Everything a runner needs, backed by memory.
#[derive(Debug)]
pub struct TestEngine {
    /// Job store.
    pub store: Arc<InMemoryJobStore>,
    /// Blob store behind external checkpoints.
    pub blobs: Arc<InMemoryContextStore>,
    /// Sink receiving every committed event.
    pub sink: Arc<CollectingEventSink>,
    /// Checkpoint manager over `store` and `blobs`.
    pub checkpoints: CheckpointManager,
    /// Runner with immediate retries.
    pub runner: JobRunner,
}

impl TestEngine {
    /// Creates an engine over `registry` with the default checkpoint policy.
    #[must_use]
    pub fn new(registry: ActionRegistry) -> Self {
        Self::with_policy(registry, CheckpointPolicy::default())
    }

    /// Creates an engine over the built-in actions.
    #[must_use]
    pub fn builtins() -> Self {
        Self::new(ActionRegistry::with_builtins())
    }

    /// Creates an engine with a specific checkpoint policy.
    #[must_use]
    pub fn with_policy(registry: ActionRegistry, policy: CheckpointPolicy) -> Self {
        let store = Arc::new(InMemoryJobStore::new());
        let blobs = Arc::new(InMemoryContextStore::new());
        let sink = Arc::new(CollectingEventSink::new());
        let checkpoints = CheckpointManager::new(store.clone(), blobs.clone(), policy);
        let runner = JobRunner::new(Arc::new(registry), store.clone(), checkpoints.clone())
            .with_sink(sink.clone())
            .with_retry_config(RetryConfig::immediate());
        Self {
            store,
            blobs,
            sink,
            checkpoints,
            runner,
        }
    }

    /// Persists a pending job for `definition`.
    pub async fn create_job(
        &self,
        definition: &StrategyDefinition,
        parameters: BTreeMap<String, serde_json::Value>,
        max_retries: u32,
    ) -> Result<Job, MapflowError> {
        let job = Job::new(
            definition.name.clone(),
            definition.version.clone(),
            definition.steps.len(),
            definition.merge_parameters(&parameters),
        )
        .with_max_retries(max_retries);
        self.store.create_job(&job).await?;
        Ok(job)
    }

    /// Creates and runs a job from an empty context.
    pub async fn run(
        &self,
        definition: &StrategyDefinition,
        parameters: BTreeMap<String, serde_json::Value>,
    ) -> Result<JobOutcome, MapflowError> {
        let job = self.create_job(definition, parameters, 0).await?;
        self.runner
            .run(
                job.id,
                definition,
                StartPoint::Fresh(ExecutionContext::new()),
                &CancellationToken::new(),
            )
            .await
    }
}

/// The forward/reverse reconciliation strategy.
///
/// Forward `{p1: [t1, t2]}`, reverse `{t1: [p1]}`, requested sources
/// `p1` and `p9`.
#[must_use]
pub fn reconcile_strategy() -> StrategyDefinition {
    StrategyDefinition::new("protein_reconciliation")
        .with_description("Reconcile forward and reverse identifier mappings")
        .with_parameter("source_ids", json!(["p1", "p9"]))
        .with_parameter("output_key", json!("reconciled"))
        .with_step(
            StepDefinition::new("load_sources", "load_identifiers")
                .with_param("identifiers", json!("${parameters.source_ids}"))
                .with_param("output_key", json!("source_ids")),
        )
        .with_step(
            StepDefinition::new("load_forward", "load_mappings")
                .with_param("rows", json!([["p1", "t1"], ["p1", "t2"]]))
                .with_param("output_key", json!("forward")),
        )
        .with_step(
            StepDefinition::new("load_reverse", "load_mappings")
                .with_param("rows", json!([{"from_id": "t1", "to_id": "p1", "confidence": 0.9}]))
                .with_param("output_key", json!("reverse")),
        )
        .with_step(
            StepDefinition::new("reconcile", "reconcile_bidirectional")
                .with_param("forward_key", json!("forward"))
                .with_param("reverse_key", json!("reverse"))
                .with_param("source_ids_key", json!("source_ids"))
                .with_param("output_key", json!("${parameters.output_key}"))
                .with_param("unmapped_key", json!("unmapped")),
        )
        .with_step(
            StepDefinition::new("export", "export_results")
                .with_param("input_key", json!("${parameters.output_key}"))
                .with_param("path", json!("out/${parameters.output_key}.json")),
        )
}

/// A strategy of mock steps named `names`, each writing `<name>_out`.
#[must_use]
pub fn mock_strategy(names: &[&str]) -> StrategyDefinition {
    names.iter().fold(StrategyDefinition::new("mock_strategy"), |definition, name| {
        definition.with_step(
            StepDefinition::new(*name, "mock")
                .with_param("output_key", json!(format!("{name}_out")))
                .with_param("ids", json!([name])),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobStatus;

    #[test]
    fn test_mock_strategy_shape() {
        let definition = mock_strategy(&["a", "b"]);
        assert_eq!(definition.steps.len(), 2);
        assert_eq!(definition.steps[1].params["output_key"], json!("b_out"));
    }

    #[tokio::test]
    async fn test_engine_runs_builtin_strategy() {
        let engine = TestEngine::builtins();
        let outcome = engine.run(&reconcile_strategy(), BTreeMap::new()).await.unwrap();
        assert_eq!(outcome.status(), JobStatus::Completed);
        assert!(!engine.sink.is_empty());
    }
}
