//! Parameter schemas and validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{ActionError, ContractErrorInfo, ContractSuggestions, ValidationError};

/// Declared type of an action parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// A string. Numbers and booleans are rendered as text.
    String,
    /// A signed integer. Numeric strings are parsed.
    Integer,
    /// A float. Numeric strings are parsed.
    Float,
    /// A boolean. `"true"` and `"false"` are parsed.
    Boolean,
    /// A list of strings. A single string is split on commas.
    StringList,
    /// A JSON object.
    Object,
    /// Anything.
    Any,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::StringList => "string_list",
            Self::Object => "object",
            Self::Any => "any",
        })
    }
}

impl ParamType {
    /// Coerces a value to this type, or returns `None` if it cannot be.
    #[must_use]
    pub fn coerce(&self, value: &serde_json::Value) -> Option<serde_json::Value> {
        use serde_json::Value;
        match (self, value) {
            (Self::Any, v) => Some(v.clone()),
            (Self::String, Value::String(_)) => Some(value.clone()),
            (Self::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            (Self::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
            (Self::Integer, Value::Number(n)) => n
                .as_i64()
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                        .map(|f| f as i64)
                })
                .map(Value::from),
            (Self::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (Self::Float, Value::Number(n)) => n.as_f64().map(Value::from),
            (Self::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::from),
            (Self::Boolean, Value::Bool(_)) => Some(value.clone()),
            (Self::Boolean, Value::String(s)) => match s.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (Self::StringList, Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Some(Value::String(s.clone())),
                    Value::Number(n) => Some(Value::String(n.to_string())),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            (Self::StringList, Value::String(s)) => Some(Value::Array(
                s.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            )),
            (Self::Object, Value::Object(_)) => Some(value.clone()),
            _ => None,
        }
    }
}

/// Declaration of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name.
    pub name: String,
    /// Declared type.
    pub param_type: ParamType,
    /// Whether the parameter must be supplied (when it has no default).
    pub required: bool,
    /// Value used when the parameter is omitted.
    pub default: Option<serde_json::Value>,
    /// Human readable description.
    pub description: String,
}

impl ParamSpec {
    /// Declares a required parameter.
    #[must_use]
    pub fn required(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            default: None,
            description: String::new(),
        }
    }

    /// Declares an optional parameter.
    #[must_use]
    pub fn optional(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type)
        }
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// The parameter schema of an action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    params: Vec<ParamSpec>,
}

fn param_error(step: &str, code: &str, message: String) -> ValidationError {
    let mut info = ContractErrorInfo::new(code, message.clone()).with_context_entry("step", step);
    if let Some(hint) = ContractSuggestions::get(code) {
        info = info.with_fix_hint(hint);
    }
    ValidationError::new(message)
        .for_step(step)
        .with_error_info(info)
}

impl ParamSchema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter.
    #[must_use]
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// The declared parameters.
    #[must_use]
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Looks up a parameter declaration.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Checks parameter names only: rejects unknown names and requires
    /// every required parameter without a default. Used when some values
    /// are only known at run time.
    pub fn check_names(
        &self,
        step: &str,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), ValidationError> {
        if let Some(unknown) = params.keys().find(|name| self.get(name).is_none()) {
            return Err(param_error(
                step,
                "PARAM-003-UNKNOWN",
                format!("Step '{step}': unknown parameter '{unknown}'"),
            ));
        }
        if let Some(missing) = self.params.iter().find(|spec| {
            spec.required
                && spec.default.is_none()
                && params.get(&spec.name).map_or(true, serde_json::Value::is_null)
        }) {
            return Err(param_error(
                step,
                "PARAM-001-MISSING",
                format!("Step '{step}': missing required parameter '{}'", missing.name),
            ));
        }
        Ok(())
    }

    /// Validates `params` for `step`: rejects unknown names, coerces
    /// types, fills defaults and requires the rest.
    pub fn validate(
        &self,
        step: &str,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Result<ValidatedParams, ValidationError> {
        self.check_names(step, params)?;

        let mut values = BTreeMap::new();
        for spec in &self.params {
            match params.get(&spec.name).filter(|v| !v.is_null()) {
                Some(raw) => {
                    let coerced = spec.param_type.coerce(raw).ok_or_else(|| {
                        param_error(
                            step,
                            "PARAM-002-TYPE",
                            format!(
                                "Step '{step}': parameter '{}' expects {}, got {raw}",
                                spec.name, spec.param_type
                            ),
                        )
                    })?;
                    values.insert(spec.name.clone(), coerced);
                }
                None => {
                    if let Some(default) = &spec.default {
                        values.insert(spec.name.clone(), default.clone());
                    } else if spec.required {
                        return Err(param_error(
                            step,
                            "PARAM-001-MISSING",
                            format!("Step '{step}': missing required parameter '{}'", spec.name),
                        ));
                    }
                }
            }
        }
        Ok(ValidatedParams { values })
    }
}

/// Parameters that passed schema validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidatedParams {
    values: BTreeMap<String, serde_json::Value>,
}

impl ValidatedParams {
    /// Wraps already validated values.
    #[must_use]
    pub fn from_values(values: BTreeMap<String, serde_json::Value>) -> Self {
        Self { values }
    }

    /// Gets a raw value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.values.get(name)
    }

    /// Gets a string value.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(serde_json::Value::as_str)
    }

    /// Gets a float value.
    #[must_use]
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(serde_json::Value::as_f64)
    }

    /// Gets an integer value.
    #[must_use]
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.values.get(name).and_then(serde_json::Value::as_i64)
    }

    /// Gets a boolean value.
    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.values.get(name).and_then(serde_json::Value::as_bool)
    }

    /// Gets a string list value.
    #[must_use]
    pub fn get_string_list(&self, name: &str) -> Option<Vec<String>> {
        self.values.get(name).and_then(|v| {
            v.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
        })
    }

    /// Gets a string value the action cannot run without.
    pub fn require_str(&self, name: &str) -> Result<&str, ActionError> {
        self.get_str(name)
            .ok_or_else(|| ActionError::permanent(format!("parameter '{name}' is not set")))
    }

    /// All values as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.values).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ParamSchema {
        ParamSchema::new()
            .param(ParamSpec::required("input_key", ParamType::String))
            .param(ParamSpec::optional("threshold", ParamType::Float).with_default(json!(0.5)))
            .param(ParamSpec::optional("limit", ParamType::Integer))
            .param(ParamSpec::optional("ids", ParamType::StringList))
    }

    fn params(value: serde_json::Value) -> BTreeMap<String, serde_json::Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_defaults_are_filled() {
        let validated = schema().validate("s", &params(json!({"input_key": "proteins"}))).unwrap();
        assert_eq!(validated.get_str("input_key"), Some("proteins"));
        assert_eq!(validated.get_f64("threshold"), Some(0.5));
        assert!(validated.get("limit").is_none());
    }

    #[test]
    fn test_missing_required() {
        let err = schema().validate("s", &BTreeMap::new()).unwrap_err();
        assert_eq!(err.code(), Some("PARAM-001-MISSING"));
        assert_eq!(err.steps, vec!["s".to_string()]);
    }

    #[test]
    fn test_unknown_param_rejected() {
        let err = schema()
            .validate("s", &params(json!({"input_key": "x", "bogus": 1})))
            .unwrap_err();
        assert_eq!(err.code(), Some("PARAM-003-UNKNOWN"));
        assert!(err.message.contains("bogus"));
    }

    #[test]
    fn test_type_mismatch() {
        let err = schema()
            .validate("s", &params(json!({"input_key": "x", "threshold": "high"})))
            .unwrap_err();
        assert_eq!(err.code(), Some("PARAM-002-TYPE"));
    }

    #[test]
    fn test_string_coercions() {
        let validated = schema()
            .validate(
                "s",
                &params(json!({"input_key": 7, "threshold": "0.8", "limit": "10", "ids": "a, b,,c"})),
            )
            .unwrap();
        assert_eq!(validated.get_str("input_key"), Some("7"));
        assert_eq!(validated.get_f64("threshold"), Some(0.8));
        assert_eq!(validated.get_i64("limit"), Some(10));
        assert_eq!(
            validated.get_string_list("ids"),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_integer_from_whole_float() {
        assert_eq!(ParamType::Integer.coerce(&json!(3.0)), Some(json!(3)));
        assert_eq!(ParamType::Integer.coerce(&json!(3.5)), None);
        assert_eq!(ParamType::Boolean.coerce(&json!("true")), Some(json!(true)));
        assert_eq!(ParamType::Object.coerce(&json!([1])), None);
    }

    #[test]
    fn test_null_counts_as_missing() {
        let validated = schema()
            .validate("s", &params(json!({"input_key": "x", "threshold": null})))
            .unwrap();
        assert_eq!(validated.get_f64("threshold"), Some(0.5));
    }

    #[test]
    fn test_check_names_ignores_types() {
        let schema = schema();
        assert!(schema
            .check_names("s", &params(json!({"input_key": "x", "threshold": "${ratio}"})))
            .is_ok());
        assert_eq!(
            schema.check_names("s", &BTreeMap::new()).unwrap_err().code(),
            Some("PARAM-001-MISSING")
        );
    }

    #[test]
    fn test_require_str() {
        let validated = ValidatedParams::default();
        assert!(!validated.require_str("x").unwrap_err().retryable);
    }
}
