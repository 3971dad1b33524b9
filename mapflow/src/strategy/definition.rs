//! Strategy documents.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::MapflowError;

fn default_version() -> String {
    "1.0".to_string()
}

fn default_required() -> bool {
    true
}

/// One step of a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name, unique within the strategy.
    pub name: String,
    /// Registered action type.
    #[serde(alias = "action")]
    pub action_type: String,
    /// Raw parameters, possibly holding `${...}` placeholders.
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    /// Whether a failure fails the job.
    #[serde(default = "default_required")]
    pub is_required: bool,
    /// Overrides the job's retry limit for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl StepDefinition {
    /// Creates a required step.
    #[must_use]
    pub fn new(name: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action_type: action_type.into(),
            params: BTreeMap::new(),
            is_required: true,
            max_retries: None,
        }
    }

    /// Sets a parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    /// Marks the step optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.is_required = false;
        self
    }

    /// Overrides the retry limit.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A declarative, linear pipeline of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDefinition {
    /// Strategy name.
    pub name: String,
    /// Strategy version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Human readable description.
    #[serde(default)]
    pub description: String,
    /// Default job parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Steps in execution order.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

impl StrategyDefinition {
    /// Creates an empty strategy.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: String::new(),
            parameters: BTreeMap::new(),
            steps: Vec::new(),
        }
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets a default parameter.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Parses a YAML document.
    pub fn from_yaml_str(source: &str) -> Result<Self, MapflowError> {
        serde_yaml::from_str(source).map_err(|e| MapflowError::Serialization(e.to_string()))
    }

    /// Parses a JSON document.
    pub fn from_json_str(source: &str) -> Result<Self, MapflowError> {
        Ok(serde_json::from_str(source)?)
    }

    /// Loads a strategy file, choosing the format by extension.
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("reading strategy file {}", path.display()))?;
        let parsed = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&source),
            _ => Self::from_yaml_str(&source),
        };
        parsed.with_context(|| format!("parsing strategy file {}", path.display()))
    }

    /// Strategy defaults overlaid by submitted parameters.
    #[must_use]
    pub fn merge_parameters(
        &self,
        submitted: &BTreeMap<String, serde_json::Value>,
    ) -> BTreeMap<String, serde_json::Value> {
        let mut merged = self.parameters.clone();
        merged.extend(submitted.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const YAML: &str = r#"
name: protein_harmonization
description: Map UniProt accessions to HMDB
parameters:
  min_confidence: 0.8
steps:
  - name: load
    action: load_identifiers
    params:
      identifiers: ["P1", "P2"]
      output_key: proteins
  - name: filter
    action_type: filter_by_confidence
    is_required: false
    max_retries: 2
    params:
      input_key: forward
      output_key: confident
      min_confidence: "${parameters.min_confidence}"
"#;

    #[test]
    fn test_parse_yaml() {
        let strategy = StrategyDefinition::from_yaml_str(YAML).unwrap();
        assert_eq!(strategy.name, "protein_harmonization");
        assert_eq!(strategy.version, "1.0");
        assert_eq!(strategy.steps.len(), 2);
        assert!(strategy.steps[0].is_required);
        assert_eq!(strategy.steps[0].action_type, "load_identifiers");
        assert!(!strategy.steps[1].is_required);
        assert_eq!(strategy.steps[1].max_retries, Some(2));
    }

    #[test]
    fn test_json_matches_builder() {
        let built = StrategyDefinition::new("s")
            .with_parameter("k", json!(1))
            .with_step(StepDefinition::new("a", "load_identifiers").with_param("output_key", json!("ids")));
        let parsed = StrategyDefinition::from_json_str(&serde_json::to_string(&built).unwrap()).unwrap();
        assert_eq!(parsed, built);
    }

    #[test]
    fn test_invalid_yaml() {
        let err = StrategyDefinition::from_yaml_str("steps: [").unwrap_err();
        assert_eq!(err.kind(), "serialization");
    }

    #[test]
    fn test_merge_parameters() {
        let strategy = StrategyDefinition::new("s")
            .with_parameter("a", json!(1))
            .with_parameter("b", json!(2));
        let submitted = BTreeMap::from([("b".to_string(), json!(3)), ("c".to_string(), json!(4))]);
        let merged = strategy.merge_parameters(&submitted);
        assert_eq!(merged.get("a"), Some(&json!(1)));
        assert_eq!(merged.get("b"), Some(&json!(3)));
        assert_eq!(merged.get("c"), Some(&json!(4)));
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.yaml");
        std::fs::write(&path, YAML).unwrap();
        assert_eq!(StrategyDefinition::from_path(&path).unwrap().steps.len(), 2);

        let missing = StrategyDefinition::from_path(dir.path().join("none.yaml")).unwrap_err();
        assert!(missing.to_string().contains("reading strategy file"));
    }
}
