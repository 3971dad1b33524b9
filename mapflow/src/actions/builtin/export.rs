//! Export of datasets as output files.

use async_trait::async_trait;
use std::path::Path;

use crate::actions::{
    Action, ActionDescriptor, ContextCapabilities, ParamSchema, ParamSpec, ParamType,
    ValidatedParams,
};
use crate::context::{OutputFile, ScopedContext};
use crate::core::{ActionResult, StepMetrics};
use crate::errors::ActionError;

/// Records a dataset as an output file of the job, optionally writing it
/// as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExportResults;

#[async_trait]
impl Action for ExportResults {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor::new("export_results", "Record a dataset as an output file")
            .with_params(
                ParamSchema::new()
                    .param(ParamSpec::required("input_key", ParamType::String))
                    .param(ParamSpec::required("path", ParamType::String))
                    .param(
                        ParamSpec::optional("format", ParamType::String)
                            .with_default(serde_json::json!("json")),
                    )
                    .param(
                        ParamSpec::optional("materialize", ParamType::Boolean)
                            .with_default(serde_json::json!(false))
                            .with_description("Write the dataset to `path` as JSON"),
                    ),
            )
            .with_capabilities(ContextCapabilities::new().reads_param("input_key"))
    }

    async fn execute(
        &self,
        params: &ValidatedParams,
        ctx: &mut ScopedContext<'_>,
    ) -> Result<ActionResult, ActionError> {
        let input_key = params.require_str("input_key")?;
        let path = params.require_str("path")?;
        let format = params.get_str("format").unwrap_or("json");

        let dataset = ctx.read(input_key)?;
        let rows = dataset.len() as u64;

        if params.get_bool("materialize").unwrap_or(false) {
            if format != "json" {
                return Err(ActionError::permanent(format!(
                    "cannot materialize format '{format}', only json is written"
                )));
            }
            let bytes = serde_json::to_vec_pretty(&dataset.to_json())
                .map_err(|e| ActionError::permanent(e.to_string()))?;
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ActionError::transient(format!("create {}: {e}", parent.display())))?;
            }
            tokio::fs::write(path, bytes)
                .await
                .map_err(|e| ActionError::transient(format!("write {path}: {e}")))?;
        }

        ctx.add_output_file(OutputFile {
            dataset_key: input_key.to_string(),
            path: path.to_string(),
            format: format.to_string(),
        });

        Ok(ActionResult::ok(format!("Exported '{input_key}' to {path}"))
            .with_metrics(StepMetrics::new().with_processed(rows))
            .with_data("path", serde_json::json!(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use serde_json::json;
    use std::collections::BTreeMap;

    async fn export(raw: serde_json::Value, ctx: &mut ExecutionContext) -> Result<ActionResult, ActionError> {
        let descriptor = ExportResults.descriptor();
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_value(raw).unwrap();
        let params = descriptor.params.validate("export", &raw).unwrap();
        let access = descriptor.capabilities.resolve("export", &params).unwrap();
        let mut scoped = ScopedContext::new(ctx, &access);
        ExportResults.execute(&params, &mut scoped).await
    }

    #[tokio::test]
    async fn test_records_output_file() {
        let mut ctx = ExecutionContext::new().with_dataset("ids", vec!["P1".to_string()]);
        export(json!({"input_key": "ids", "path": "/out/ids.csv", "format": "csv"}), &mut ctx)
            .await
            .unwrap();

        assert_eq!(ctx.output_files().len(), 1);
        assert_eq!(ctx.output_files()[0].format, "csv");
    }

    #[tokio::test]
    async fn test_materialize_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ids.json");
        let mut ctx = ExecutionContext::new().with_dataset("ids", vec!["P1".to_string()]);

        export(
            json!({"input_key": "ids", "path": path.to_str().unwrap(), "materialize": true}),
            &mut ctx,
        )
        .await
        .unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, json!(["P1"]));
    }
}
