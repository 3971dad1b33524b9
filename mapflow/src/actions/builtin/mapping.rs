//! Actions over mapping tables, including bidirectional reconciliation.

use async_trait::async_trait;
use tracing::debug;

use crate::actions::{
    Action, ActionDescriptor, ContextCapabilities, ParamSchema, ParamSpec, ParamType,
    ValidatedParams,
};
use crate::context::{Dataset, ScopedContext};
use crate::core::{ActionResult, ResultArtifact, StepMetrics};
use crate::errors::ActionError;
use crate::reconcile::{BidirectionalReconciler, CanonicalGrouping, ConfidencePolicy, ReconcileRequest};

/// Builds a reverse table by reading a forward table backwards.
#[derive(Debug, Default, Clone, Copy)]
pub struct InvertMappings;

#[async_trait]
impl Action for InvertMappings {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new("invert_mappings", "Invert a mapping table")
            .with_params(
                ParamSchema::new()
                    .param(ParamSpec::required("input_key", ParamType::String))
                    .param(ParamSpec::required("output_key", ParamType::String)),
            )
            .with_capabilities(
                ContextCapabilities::new()
                    .reads_param("input_key")
                    .writes_param("output_key"),
            )
    }

    async fn execute(
        &self,
        params: &ValidatedParams,
        ctx: &mut ScopedContext<'_>,
    ) -> Result<ActionResult, ActionError> {
        let input_key = params.require_str("input_key")?;
        let output_key = params.require_str("output_key")?;
        let inverted = ctx.mappings(input_key)?.inverted();
        let rows = inverted.len() as u64;

        ctx.write(output_key, Dataset::Mappings(inverted))?;

        Ok(ActionResult::ok(format!("Inverted {rows} rows from '{input_key}'"))
            .with_metrics(StepMetrics::new().with_processed(rows).with_matched(rows)))
    }
}

/// Keeps the rows of a mapping table at or above a confidence floor.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilterByConfidence;

#[async_trait]
impl Action for FilterByConfidence {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new("filter_by_confidence", "Drop low-confidence mapping rows")
            .with_params(
                ParamSchema::new()
                    .param(ParamSpec::required("input_key", ParamType::String))
                    .param(ParamSpec::required("output_key", ParamType::String))
                    .param(ParamSpec::required("min_confidence", ParamType::Float)),
            )
            .with_capabilities(
                ContextCapabilities::new()
                    .reads_param("input_key")
                    .writes_param("output_key"),
            )
    }

    async fn execute(
        &self,
        params: &ValidatedParams,
        ctx: &mut ScopedContext<'_>,
    ) -> Result<ActionResult, ActionError> {
        let input_key = params.require_str("input_key")?;
        let output_key = params.require_str("output_key")?;
        let min_confidence = params
            .get_f64("min_confidence")
            .ok_or_else(|| ActionError::permanent("parameter 'min_confidence' is not set"))?;
        if !(0.0..=1.0).contains(&min_confidence) {
            return Err(ActionError::permanent(format!(
                "min_confidence must be within [0, 1], got {min_confidence}"
            )));
        }

        let table = ctx.mappings(input_key)?;
        let before = table.len() as u64;
        let filtered = table.filter_min_confidence(min_confidence);
        let kept = filtered.len() as u64;

        ctx.write(output_key, Dataset::Mappings(filtered))?;

        Ok(ActionResult::ok(format!("Kept {kept} of {before} rows"))
            .with_metrics(
                StepMetrics::new()
                    .with_processed(before)
                    .with_matched(kept)
                    .with_failed(before - kept),
            ))
    }
}

/// Reconciles a forward and a reverse mapping table.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileBidirectional;

impl ReconcileBidirectional {
    fn reconciler(params: &ValidatedParams) -> Result<BidirectionalReconciler, ActionError> {
        let grouping = match params.get_str("canonical_grouping").unwrap_or("by_source") {
            "by_source" => CanonicalGrouping::BySource,
            "by_target" => CanonicalGrouping::ByTarget,
            other => {
                return Err(ActionError::permanent(format!(
                    "unknown canonical_grouping '{other}', expected by_source or by_target"
                )))
            }
        };

        let mut policy = ConfidencePolicy::default();
        if let Some(p) = params.get_f64("hop_penalty") {
            policy = policy.with_hop_penalty(p);
        }
        if let Some(p) = params.get_f64("reverse_only_penalty") {
            policy = policy.with_reverse_only_penalty(p);
        }
        if let Some(p) = params.get_f64("ambiguity_penalty") {
            policy = policy.with_ambiguity_penalty(p);
        }
        if let Some(b) = params.get_f64("validation_bonus") {
            policy = policy.with_validation_bonus(b);
        }

        Ok(BidirectionalReconciler::new()
            .with_policy(policy)
            .with_grouping(grouping))
    }
}

#[async_trait]
impl Action for ReconcileBidirectional {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new(
            "reconcile_bidirectional",
            "Merge forward and reverse mappings into scored, cardinality-annotated records",
        )
        .with_params(
            ParamSchema::new()
                .param(ParamSpec::required("forward_key", ParamType::String))
                .param(ParamSpec::required("reverse_key", ParamType::String))
                .param(ParamSpec::required("output_key", ParamType::String))
                .param(
                    ParamSpec::optional("unmapped_key", ParamType::String)
                        .with_description("Dataset receiving ids absent from both directions"),
                )
                .param(
                    ParamSpec::optional("source_ids_key", ParamType::String)
                        .with_description("Identifiers requested on the source side"),
                )
                .param(ParamSpec::optional("target_ids_key", ParamType::String))
                .param(
                    ParamSpec::optional("canonical_grouping", ParamType::String)
                        .with_default(serde_json::json!("by_source")),
                )
                .param(ParamSpec::optional("hop_penalty", ParamType::Float))
                .param(ParamSpec::optional("reverse_only_penalty", ParamType::Float))
                .param(ParamSpec::optional("ambiguity_penalty", ParamType::Float))
                .param(ParamSpec::optional("validation_bonus", ParamType::Float)),
        )
        .with_capabilities(
            ContextCapabilities::new()
                .reads_param("forward_key")
                .reads_param("reverse_key")
                .reads_param("source_ids_key")
                .reads_param("target_ids_key")
                .writes_param("output_key")
                .writes_param("unmapped_key"),
        )
    }

    async fn execute(
        &self,
        params: &ValidatedParams,
        ctx: &mut ScopedContext<'_>,
    ) -> Result<ActionResult, ActionError> {
        let reconciler = Self::reconciler(params)?;
        let output_key = params.require_str("output_key")?;

        let forward = ctx.mappings(params.require_str("forward_key")?)?.clone();
        let reverse = ctx.mappings(params.require_str("reverse_key")?)?.clone();
        let mut request = ReconcileRequest::new(forward, reverse);
        if let Some(key) = params.get_str("source_ids_key") {
            request = request.with_requested_sources(ctx.identifiers(key)?.to_vec());
        }
        if let Some(key) = params.get_str("target_ids_key") {
            request = request.with_requested_targets(ctx.identifiers(key)?.to_vec());
        }

        let output = reconciler
            .reconcile(&request)
            .map_err(|e| ActionError::permanent(e.to_string()))?;
        let stats = output.stats;
        debug!(
            records = stats.total_records,
            validated = stats.validated,
            canonical = stats.canonical,
            "Reconciliation finished"
        );

        let canonical: Vec<f64> = output.canonical().map(|r| r.confidence).collect();
        let mut metrics = StepMetrics::new()
            .with_processed(stats.total_records as u64)
            .with_matched(stats.validated as u64)
            .with_failed((stats.unmapped_sources + stats.unmapped_targets) as u64)
            .with_extra("one_to_many_sources", stats.one_to_many_sources as f64)
            .with_extra("one_to_many_targets", stats.one_to_many_targets as f64);
        if !canonical.is_empty() {
            metrics = metrics.with_confidence(canonical.iter().sum::<f64>() / canonical.len() as f64);
        }

        if let Some(unmapped_key) = params.get_str("unmapped_key") {
            let ids = output.unmapped.iter().map(|u| u.id.clone()).collect();
            ctx.write(unmapped_key, Dataset::Identifiers(ids))?;
        }
        let stats_json = serde_json::to_value(&stats).unwrap_or_default();
        ctx.write(output_key, Dataset::Reconciled(output))?;

        Ok(ActionResult::ok(format!(
            "Reconciled {} pairs ({} validated, {} unmapped)",
            stats.total_records,
            stats.validated,
            stats.unmapped_sources + stats.unmapped_targets
        ))
        .with_metrics(metrics)
        .with_data("output_key", serde_json::json!(output_key))
        .with_artifact(ResultArtifact::json("reconciliation_stats", stats_json)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::reconcile::{MappingTable, ValidationStatus};
    use serde_json::json;
    use std::collections::BTreeMap;

    async fn run(
        action: &dyn Action,
        raw: serde_json::Value,
        ctx: &mut ExecutionContext,
    ) -> Result<ActionResult, ActionError> {
        let descriptor = action.descriptor();
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_value(raw).unwrap();
        let params = descriptor.params.validate("step", &raw).unwrap();
        let access = descriptor.capabilities.resolve("step", &params).unwrap();
        let mut scoped = ScopedContext::new(ctx, &access);
        action.execute(&params, &mut scoped).await
    }

    #[tokio::test]
    async fn test_invert() {
        let mut ctx =
            ExecutionContext::new().with_dataset("fwd", MappingTable::from_pairs([("P1", "T1")]));
        run(&InvertMappings, json!({"input_key": "fwd", "output_key": "rev"}), &mut ctx)
            .await
            .unwrap();
        let rev = ctx.get("rev").and_then(Dataset::as_mappings).unwrap();
        assert_eq!(rev.rows()[0].from_id, "T1");
    }

    #[tokio::test]
    async fn test_filter_by_confidence() {
        let table = MappingTable::from_rows(vec![
            crate::reconcile::MappingRow::new("P1", "T1", 0.9),
            crate::reconcile::MappingRow::new("P2", "T2", 0.3),
        ]);
        let mut ctx = ExecutionContext::new().with_dataset("fwd", table);
        let result = run(
            &FilterByConfidence,
            json!({"input_key": "fwd", "output_key": "high", "min_confidence": 0.5}),
            &mut ctx,
        )
        .await
        .unwrap();
        assert_eq!(result.metrics.records_failed, 1);
        assert_eq!(ctx.get("high").map(Dataset::len), Some(1));

        let err = run(
            &FilterByConfidence,
            json!({"input_key": "fwd", "output_key": "x", "min_confidence": 1.5}),
            &mut ctx,
        )
        .await
        .unwrap_err();
        assert!(err.message.contains("within [0, 1]"));
    }

    #[tokio::test]
    async fn test_reconcile_writes_records_and_unmapped() {
        let mut ctx = ExecutionContext::new()
            .with_dataset("fwd", MappingTable::from_pairs([("p1", "t1"), ("p1", "t2")]))
            .with_dataset("rev", MappingTable::from_pairs([("t1", "p1")]))
            .with_dataset("ids", vec!["p1".to_string(), "p9".to_string()]);

        let result = run(
            &ReconcileBidirectional,
            json!({
                "forward_key": "fwd",
                "reverse_key": "rev",
                "output_key": "reconciled",
                "unmapped_key": "unmapped",
                "source_ids_key": "ids"
            }),
            &mut ctx,
        )
        .await
        .unwrap();

        assert_eq!(result.metrics.records_processed, 2);
        assert_eq!(result.metrics.records_matched, 1);
        assert_eq!(result.artifacts[0].key, "reconciliation_stats");

        let output = ctx.get("reconciled").and_then(Dataset::as_reconciled).unwrap();
        let validated = output.record("p1", "t1").unwrap();
        assert_eq!(validated.validation_status, ValidationStatus::Validated);
        assert!(validated.is_canonical_mapping);
        assert_eq!(
            ctx.get("unmapped").and_then(Dataset::as_identifiers),
            Some(&["p9".to_string()][..])
        );
    }

    #[tokio::test]
    async fn test_reconcile_rejects_unknown_grouping() {
        let mut ctx = ExecutionContext::new()
            .with_dataset("fwd", MappingTable::new())
            .with_dataset("rev", MappingTable::new());
        let err = run(
            &ReconcileBidirectional,
            json!({
                "forward_key": "fwd",
                "reverse_key": "rev",
                "output_key": "out",
                "canonical_grouping": "sideways"
            }),
            &mut ctx,
        )
        .await
        .unwrap_err();
        assert!(err.message.contains("sideways"));
    }
}
