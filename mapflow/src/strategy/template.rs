//! `${...}` placeholder resolution in step parameters.
//!
//! `${parameters.X}` refers to job parameter `X`; any other `${key}`
//! refers to a dataset written by an earlier step. A string that is
//! exactly one placeholder becomes the referenced value with its type;
//! placeholders embedded in longer strings are interpolated as text.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use thiserror::Error;

use crate::context::ExecutionContext;
use crate::errors::{ContractErrorInfo, ContractSuggestions, ValidationError};

const PARAMETER_PREFIX: &str = "parameters.";

#[allow(clippy::expect_used)]
fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid placeholder regex"))
}

/// What a placeholder refers to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reference {
    /// A job parameter.
    Parameter(String),
    /// A dataset key.
    Dataset(String),
}

impl Reference {
    fn parse(inner: &str) -> Self {
        let inner = inner.trim();
        match inner.strip_prefix(PARAMETER_PREFIX) {
            Some(name) => Self::Parameter(name.to_string()),
            None => Self::Dataset(inner.to_string()),
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parameter(name) => write!(f, "${{{PARAMETER_PREFIX}{name}}}"),
            Self::Dataset(key) => write!(f, "${{{key}}}"),
        }
    }
}

/// Errors from placeholder resolution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// A referenced parameter or dataset does not exist.
    #[error("Unresolved reference {reference} in parameter '{param}'")]
    Unresolved {
        /// The parameter holding the placeholder.
        param: String,
        /// The reference that failed.
        reference: Reference,
    },
}

impl TemplateError {
    /// Converts into a validation error for a step.
    #[must_use]
    pub fn into_validation(self, step: &str) -> ValidationError {
        let code = "STRATEGY-002-UNRESOLVED";
        let mut info = ContractErrorInfo::new(code, self.to_string()).with_context_entry("step", step);
        if let Some(hint) = ContractSuggestions::get(code) {
            info = info.with_fix_hint(hint);
        }
        ValidationError::new(format!("Step '{step}': {self}"))
            .for_step(step)
            .with_error_info(info)
    }
}

/// Every reference in a value, in document order.
#[must_use]
pub fn references(value: &serde_json::Value) -> Vec<Reference> {
    let mut found = Vec::new();
    collect_references(value, &mut found);
    found
}

fn collect_references(value: &serde_json::Value, found: &mut Vec<Reference>) {
    match value {
        serde_json::Value::String(s) => {
            found.extend(placeholder().captures_iter(s).map(|c| Reference::parse(&c[1])));
        }
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_references(v, found)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_references(v, found)),
        _ => {}
    }
}

/// Returns true if the value still holds a dataset placeholder.
#[must_use]
pub fn has_dataset_references(value: &serde_json::Value) -> bool {
    references(value)
        .iter()
        .any(|r| matches!(r, Reference::Dataset(_)))
}

/// Resolves placeholders against job parameters and, when present, the
/// execution context.
///
/// Without a context, dataset placeholders are left in place.
#[derive(Debug, Clone, Copy)]
pub struct TemplateResolver<'a> {
    parameters: &'a BTreeMap<String, serde_json::Value>,
    context: Option<&'a ExecutionContext>,
}

impl<'a> TemplateResolver<'a> {
    /// Resolves job parameters only.
    #[must_use]
    pub fn parameters_only(parameters: &'a BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            parameters,
            context: None,
        }
    }

    /// Resolves job parameters and datasets.
    #[must_use]
    pub fn new(parameters: &'a BTreeMap<String, serde_json::Value>, context: &'a ExecutionContext) -> Self {
        Self {
            parameters,
            context: Some(context),
        }
    }

    fn lookup(&self, reference: &Reference) -> Option<Option<serde_json::Value>> {
        match reference {
            Reference::Parameter(name) => Some(self.parameters.get(name).cloned()),
            Reference::Dataset(key) => self.context.map(|ctx| ctx.get(key).map(|d| d.to_json())),
        }
    }

    /// Resolves every parameter of a step.
    pub fn resolve_params(
        &self,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Result<BTreeMap<String, serde_json::Value>, TemplateError> {
        params
            .iter()
            .map(|(name, value)| Ok((name.clone(), self.resolve_value(name, value)?)))
            .collect()
    }

    /// Resolves one parameter value. `param` names it in errors.
    pub fn resolve_value(
        &self,
        param: &str,
        value: &serde_json::Value,
    ) -> Result<serde_json::Value, TemplateError> {
        match value {
            serde_json::Value::String(s) => self.resolve_string(param, s),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_value(param, v))
                .collect::<Result<Vec<_>, _>>()
                .map(serde_json::Value::Array),
            serde_json::Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve_value(param, v)?)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(serde_json::Value::Object),
            other => Ok(other.clone()),
        }
    }

    fn resolve_string(&self, param: &str, s: &str) -> Result<serde_json::Value, TemplateError> {
        let unresolved = |reference: Reference| TemplateError::Unresolved {
            param: param.to_string(),
            reference,
        };

        if let Some(whole) = placeholder().captures(s).filter(|c| c[0].len() == s.len()) {
            let reference = Reference::parse(&whole[1]);
            return match self.lookup(&reference) {
                Some(Some(value)) => Ok(value),
                Some(None) => Err(unresolved(reference)),
                None => Ok(serde_json::Value::String(s.to_string())),
            };
        }

        let mut out = String::with_capacity(s.len());
        let mut last = 0;
        for captures in placeholder().captures_iter(s) {
            let Some(matched) = captures.get(0) else { continue };
            out.push_str(&s[last..matched.start()]);
            let reference = Reference::parse(&captures[1]);
            match self.lookup(&reference) {
                Some(Some(serde_json::Value::String(text))) => out.push_str(&text),
                Some(Some(value)) => out.push_str(&value.to_string()),
                Some(None) => return Err(unresolved(reference)),
                None => out.push_str(matched.as_str()),
            }
            last = matched.end();
        }
        out.push_str(&s[last..]);
        Ok(serde_json::Value::String(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parameters() -> BTreeMap<String, serde_json::Value> {
        BTreeMap::from([
            ("threshold".to_string(), json!(0.8)),
            ("prefix".to_string(), json!("run")),
        ])
    }

    #[test]
    fn test_references() {
        let value = json!({"a": "${parameters.threshold}", "b": ["x-${ids}-${parameters.prefix}"], "c": 3});
        assert_eq!(
            references(&value),
            vec![
                Reference::Parameter("threshold".into()),
                Reference::Dataset("ids".into()),
                Reference::Parameter("prefix".into()),
            ]
        );
        assert!(has_dataset_references(&value));
        assert!(!has_dataset_references(&json!("${parameters.x}")));
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let params = parameters();
        let resolver = TemplateResolver::parameters_only(&params);
        assert_eq!(resolver.resolve_value("t", &json!("${parameters.threshold}")).unwrap(), json!(0.8));
    }

    #[test]
    fn test_embedded_placeholder_interpolates() {
        let params = parameters();
        let resolver = TemplateResolver::parameters_only(&params);
        assert_eq!(
            resolver
                .resolve_value("p", &json!("${parameters.prefix}_out_${parameters.threshold}"))
                .unwrap(),
            json!("run_out_0.8")
        );
    }

    #[test]
    fn test_dataset_reference() {
        let params = parameters();
        let ctx = ExecutionContext::new().with_dataset("ids", vec!["P1".to_string()]);
        let resolver = TemplateResolver::new(&params, &ctx);
        assert_eq!(resolver.resolve_value("i", &json!("${ids}")).unwrap(), json!(["P1"]));

        let params_only = TemplateResolver::parameters_only(&params);
        assert_eq!(params_only.resolve_value("i", &json!("${ids}")).unwrap(), json!("${ids}"));
    }

    #[test]
    fn test_unresolved() {
        let params = parameters();
        let ctx = ExecutionContext::new();
        let resolver = TemplateResolver::new(&params, &ctx);

        let err = resolver.resolve_value("x", &json!("${parameters.missing}")).unwrap_err();
        assert_eq!(
            err,
            TemplateError::Unresolved {
                param: "x".into(),
                reference: Reference::Parameter("missing".into())
            }
        );
        assert!(resolver.resolve_value("x", &json!("a ${nothing}")).is_err());

        let validation = err.into_validation("load");
        assert_eq!(validation.code(), Some("STRATEGY-002-UNRESOLVED"));
        assert!(validation.message.contains("${parameters.missing}"));
    }

    #[test]
    fn test_nested_values_resolve() {
        let params = parameters();
        let resolver = TemplateResolver::parameters_only(&params);
        let resolved = resolver
            .resolve_params(&BTreeMap::from([(
                "opts".to_string(),
                json!({"floor": "${parameters.threshold}", "tags": ["${parameters.prefix}"]}),
            )]))
            .unwrap();
        assert_eq!(resolved["opts"], json!({"floor": 0.8, "tags": ["run"]}));
    }
}
