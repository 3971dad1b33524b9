//! Self-description of actions: parameters and context capabilities.

use serde::{Deserialize, Serialize};

use super::{ParamSchema, ValidatedParams};
use crate::context::StepAccess;
use crate::errors::{ContractErrorInfo, ValidationError};

/// A dataset key, either fixed by the action or chosen by the strategy
/// author through a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum DatasetRef {
    /// A fixed key.
    Literal(String),
    /// The value of the named string parameter.
    Param(String),
    /// Every entry of the named string list parameter.
    ParamList(String),
}

fn key_error(step: &str, name: &str, value: &serde_json::Value) -> ValidationError {
    ValidationError::new(format!(
        "Step '{step}': parameter '{name}' must name datasets, got {value}"
    ))
    .for_step(step)
    .with_error_info(
        ContractErrorInfo::new("PARAM-002-TYPE", "Dataset key parameter is not a plain string")
            .with_context_entry("param", name),
    )
}

fn plain_key(value: &serde_json::Value) -> Option<String> {
    value
        .as_str()
        .filter(|key| !key.is_empty() && !key.contains("${"))
        .map(str::to_string)
}

impl DatasetRef {
    /// Resolves the keys. An optional parameter that was not supplied
    /// resolves to no keys.
    pub fn resolve(&self, step: &str, params: &ValidatedParams) -> Result<Vec<String>, ValidationError> {
        match self {
            Self::Literal(key) => Ok(vec![key.clone()]),
            Self::Param(name) => match params.get(name) {
                None => Ok(Vec::new()),
                Some(value) => plain_key(value)
                    .map(|key| vec![key])
                    .ok_or_else(|| key_error(step, name, value)),
            },
            Self::ParamList(name) => match params.get(name) {
                None => Ok(Vec::new()),
                Some(value) => value
                    .as_array()
                    .and_then(|items| items.iter().map(plain_key).collect::<Option<Vec<_>>>())
                    .ok_or_else(|| key_error(step, name, value)),
            },
        }
    }
}

/// Dataset keys an action reads, writes and overwrites.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextCapabilities {
    /// Keys read.
    #[serde(default)]
    pub reads: Vec<DatasetRef>,
    /// Keys created.
    #[serde(default)]
    pub writes: Vec<DatasetRef>,
    /// Keys that may be replaced.
    #[serde(default)]
    pub overwrites: Vec<DatasetRef>,
}

impl ContextCapabilities {
    /// Creates an empty capability set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a read taken from a string parameter.
    #[must_use]
    pub fn reads_param(mut self, param: impl Into<String>) -> Self {
        self.reads.push(DatasetRef::Param(param.into()));
        self
    }

    /// Adds a write taken from a string parameter.
    #[must_use]
    pub fn writes_param(mut self, param: impl Into<String>) -> Self {
        self.writes.push(DatasetRef::Param(param.into()));
        self
    }

    /// Adds an overwrite taken from a string parameter.
    #[must_use]
    pub fn overwrites_param(mut self, param: impl Into<String>) -> Self {
        self.overwrites.push(DatasetRef::Param(param.into()));
        self
    }

    /// Adds reads taken from a string list parameter.
    #[must_use]
    pub fn reads_param_list(mut self, param: impl Into<String>) -> Self {
        self.reads.push(DatasetRef::ParamList(param.into()));
        self
    }

    /// Adds a fixed read key.
    #[must_use]
    pub fn reads_key(mut self, key: impl Into<String>) -> Self {
        self.reads.push(DatasetRef::Literal(key.into()));
        self
    }

    /// Adds a fixed write key.
    #[must_use]
    pub fn writes_key(mut self, key: impl Into<String>) -> Self {
        self.writes.push(DatasetRef::Literal(key.into()));
        self
    }

    /// Resolves every reference against a step's parameters.
    pub fn resolve(&self, step: &str, params: &ValidatedParams) -> Result<StepAccess, ValidationError> {
        let mut access = StepAccess::new(step);
        for reference in &self.reads {
            access.reads.extend(reference.resolve(step, params)?);
        }
        for reference in &self.writes {
            access.writes.extend(reference.resolve(step, params)?);
        }
        for reference in &self.overwrites {
            access.overwrites.extend(reference.resolve(step, params)?);
        }
        Ok(access)
    }
}

/// Everything the interpreter needs to know about an action without
/// running it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    /// Registered type name.
    pub action_type: String,
    /// What the action does.
    pub description: String,
    /// Accepted parameters.
    pub params: ParamSchema,
    /// Datasets touched.
    pub capabilities: ContextCapabilities,
}

impl ActionDescriptor {
    /// Creates a descriptor with no parameters and no capabilities.
    #[must_use]
    pub fn new(action_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            description: description.into(),
            params: ParamSchema::new(),
            capabilities: ContextCapabilities::new(),
        }
    }

    /// Sets the parameter schema.
    #[must_use]
    pub fn with_params(mut self, params: ParamSchema) -> Self {
        self.params = params;
        self
    }

    /// Sets the capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: ContextCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn params(value: serde_json::Value) -> ValidatedParams {
        let values: BTreeMap<String, serde_json::Value> = serde_json::from_value(value).unwrap();
        ValidatedParams::from_values(values)
    }

    #[test]
    fn test_resolve_param_keys() {
        let caps = ContextCapabilities::new()
            .reads_param("input_key")
            .writes_param("output_key")
            .writes_key("stats");
        let access = caps
            .resolve("s", &params(json!({"input_key": "proteins", "output_key": "mapped"})))
            .unwrap();
        assert!(access.reads.contains("proteins"));
        assert!(access.writes.contains("mapped"));
        assert!(access.writes.contains("stats"));
    }

    #[test]
    fn test_resolve_param_list() {
        let caps = ContextCapabilities::new().reads_param_list("input_keys");
        let access = caps
            .resolve("s", &params(json!({"input_keys": ["a", "b"]})))
            .unwrap();
        assert_eq!(access.reads.len(), 2);
        assert!(caps.resolve("s", &params(json!({"input_keys": ["a", ""]}))).is_err());
    }

    #[test]
    fn test_missing_optional_param_is_skipped() {
        let caps = ContextCapabilities::new().reads_param("extra_key");
        let access = caps.resolve("s", &ValidatedParams::default()).unwrap();
        assert!(access.reads.is_empty());
    }

    #[test]
    fn test_non_string_key_rejected() {
        let caps = ContextCapabilities::new().reads_param("input_key");
        assert!(caps.resolve("s", &params(json!({"input_key": 5}))).is_err());
        assert!(caps.resolve("s", &params(json!({"input_key": "${x}"}))).is_err());
    }
}
