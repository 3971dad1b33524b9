//! Actions that bring identifiers and mapping rows into the context.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;

use crate::actions::{
    Action, ActionDescriptor, ContextCapabilities, ParamSchema, ParamSpec, ParamType,
    ValidatedParams,
};
use crate::context::{Dataset, ScopedContext};
use crate::core::{ActionResult, StepMetrics};
use crate::errors::ActionError;
use crate::reconcile::{MappingRow, MappingTable};

fn dedup_ids<I>(ids: I, deduplicate: bool) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .filter(|id| !deduplicate || seen.insert(id.clone()))
        .collect()
}

/// Loads identifiers from the `identifiers` parameter.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadIdentifiers;

#[async_trait]
impl Action for LoadIdentifiers {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new("load_identifiers", "Load identifiers into a dataset")
            .with_params(
                ParamSchema::new()
                    .param(
                        ParamSpec::required("identifiers", ParamType::StringList)
                            .with_description("Identifiers to load"),
                    )
                    .param(ParamSpec::required("output_key", ParamType::String))
                    .param(
                        ParamSpec::optional("deduplicate", ParamType::Boolean)
                            .with_default(serde_json::json!(true)),
                    ),
            )
            .with_capabilities(ContextCapabilities::new().writes_param("output_key"))
    }

    async fn execute(
        &self,
        params: &ValidatedParams,
        ctx: &mut ScopedContext<'_>,
    ) -> Result<ActionResult, ActionError> {
        let output_key = params.require_str("output_key")?;
        let raw = params.get_string_list("identifiers").unwrap_or_default();
        let received = raw.len() as u64;
        let ids = dedup_ids(raw, params.get_bool("deduplicate").unwrap_or(true));
        let loaded = ids.len() as u64;

        ctx.write(output_key, Dataset::Identifiers(ids))?;
        ctx.record_statistic("loaded", serde_json::json!(loaded));

        Ok(ActionResult::ok(format!("Loaded {loaded} identifiers into '{output_key}'"))
            .with_metrics(StepMetrics::new().with_processed(received).with_matched(loaded))
            .with_data("output_key", serde_json::json!(output_key)))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RowInput {
    Row(MappingRow),
    Pair(String, String),
}

/// Loads mapping rows from the `rows` parameter.
///
/// Rows are objects (`from_id`, `to_id`, optional `confidence`,
/// `hop_count`, `path`) or `[from, to]` pairs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadMappings;

#[async_trait]
impl Action for LoadMappings {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new("load_mappings", "Load mapping rows into a mapping table")
            .with_params(
                ParamSchema::new()
                    .param(ParamSpec::required("rows", ParamType::Any))
                    .param(ParamSpec::required("output_key", ParamType::String)),
            )
            .with_capabilities(ContextCapabilities::new().writes_param("output_key"))
    }

    async fn execute(
        &self,
        params: &ValidatedParams,
        ctx: &mut ScopedContext<'_>,
    ) -> Result<ActionResult, ActionError> {
        let output_key = params.require_str("output_key")?;
        let raw = params.get("rows").cloned().unwrap_or_default();
        let rows: Vec<RowInput> = serde_json::from_value(raw)
            .map_err(|e| ActionError::permanent(format!("invalid mapping rows: {e}")))?;
        if let Some(row) = rows.iter().find_map(|row| match row {
            RowInput::Row(row) if !(0.0..=1.0).contains(&row.confidence) => Some(row),
            _ => None,
        }) {
            return Err(ActionError::permanent(format!(
                "mapping row {} -> {} has confidence {}, expected a value in [0, 1]",
                row.from_id, row.to_id, row.confidence
            )));
        }

        let table: MappingTable = rows
            .into_iter()
            .map(|row| match row {
                RowInput::Row(row) => row,
                RowInput::Pair(from, to) => MappingRow::new(from, to, 1.0),
            })
            .collect();
        let loaded = table.len() as u64;

        ctx.write(output_key, Dataset::Mappings(table))?;

        Ok(ActionResult::ok(format!("Loaded {loaded} mapping rows into '{output_key}'"))
            .with_metrics(StepMetrics::new().with_processed(loaded).with_matched(loaded)))
    }
}

/// Unions identifier datasets, keeping first-seen order.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeIdentifiers;

#[async_trait]
impl Action for MergeIdentifiers {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new("merge_identifiers", "Union several identifier datasets")
            .with_params(
                ParamSchema::new()
                    .param(ParamSpec::required("input_keys", ParamType::StringList))
                    .param(ParamSpec::required("output_key", ParamType::String)),
            )
            .with_capabilities(
                ContextCapabilities::new()
                    .reads_param_list("input_keys")
                    .writes_param("output_key"),
            )
    }

    async fn execute(
        &self,
        params: &ValidatedParams,
        ctx: &mut ScopedContext<'_>,
    ) -> Result<ActionResult, ActionError> {
        let output_key = params.require_str("output_key")?;
        let input_keys = params.get_string_list("input_keys").unwrap_or_default();

        let mut all = Vec::new();
        for key in &input_keys {
            all.extend(ctx.identifiers(key)?.iter().cloned());
        }
        let received = all.len() as u64;
        let merged = dedup_ids(all, true);
        let count = merged.len() as u64;

        ctx.write(output_key, Dataset::Identifiers(merged))?;

        Ok(ActionResult::ok(format!(
            "Merged {} datasets into {count} identifiers",
            input_keys.len()
        ))
        .with_metrics(StepMetrics::new().with_processed(received).with_matched(count)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
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
    async fn test_load_identifiers_dedups() {
        let mut ctx = ExecutionContext::new();
        let result = run(
            &LoadIdentifiers,
            json!({"identifiers": ["P1", " P2", "P1", ""], "output_key": "ids"}),
            &mut ctx,
        )
        .await
        .unwrap();

        assert_eq!(result.metrics.records_processed, 4);
        assert_eq!(result.metrics.records_matched, 2);
        assert_eq!(
            ctx.get("ids").and_then(Dataset::as_identifiers),
            Some(&["P1".to_string(), "P2".to_string()][..])
        );
        assert_eq!(ctx.statistics().get("step.loaded"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_load_mappings_accepts_rows_and_pairs() {
        let mut ctx = ExecutionContext::new();
        run(
            &LoadMappings,
            json!({
                "rows": [
                    {"from_id": "P1", "to_id": "T1", "confidence": 0.9, "hop_count": 2},
                    ["P2", "T2"]
                ],
                "output_key": "forward"
            }),
            &mut ctx,
        )
        .await
        .unwrap();

        let table = ctx.get("forward").and_then(Dataset::as_mappings).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0].hop_count, 2);
        assert!((table.rows()[1].confidence - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_load_mappings_rejects_confidence_out_of_range() {
        let mut ctx = ExecutionContext::new();
        let err = run(
            &LoadMappings,
            json!({
                "rows": [{"from_id": "P1", "to_id": "T1", "confidence": 1.5}],
                "output_key": "forward"
            }),
            &mut ctx,
        )
        .await
        .unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("P1 -> T1"));
        assert!(!ctx.contains("forward"));
    }

    #[tokio::test]
    async fn test_load_mappings_rejects_garbage() {
        let mut ctx = ExecutionContext::new();
        let err = run(&LoadMappings, json!({"rows": [1, 2], "output_key": "f"}), &mut ctx)
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert!(!ctx.contains("f"));
    }

    #[tokio::test]
    async fn test_merge_identifiers() {
        let mut ctx = ExecutionContext::new()
            .with_dataset("a", vec!["P1".to_string(), "P2".to_string()])
            .with_dataset("b", vec!["P2".to_string(), "P3".to_string()]);
        let result = run(
            &MergeIdentifiers,
            json!({"input_keys": ["a", "b"], "output_key": "all"}),
            &mut ctx,
        )
        .await
        .unwrap();

        assert_eq!(result.metrics.records_matched, 3);
        assert_eq!(ctx.get("all").map(Dataset::len), Some(3));
    }
}
