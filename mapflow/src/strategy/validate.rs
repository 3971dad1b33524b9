//! Load-time validation of strategies against the action registry.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::template::{has_dataset_references, references, Reference, TemplateResolver};
use super::{StepDefinition, StrategyDefinition};
use crate::actions::{ActionRegistry, ValidatedParams};
use crate::context::StepAccess;
use crate::errors::{ContractErrorInfo, ContractSuggestions, MapflowError, ValidationError};

/// A step that passed load-time validation.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    /// Position in the strategy.
    pub index: usize,
    /// The step as written.
    pub definition: StepDefinition,
    /// Dataset keys the step may touch.
    pub access: StepAccess,
    /// Parameter problem found at load. The step fails with it when it
    /// starts, so `is_required` decides whether the job goes on.
    pub param_error: Option<ValidationError>,
}

/// A validated strategy bound to a job's parameters.
#[derive(Debug, Clone)]
pub struct StrategyPlan {
    /// Strategy name.
    pub name: String,
    /// Strategy version.
    pub version: String,
    /// Strategy defaults overlaid by submitted parameters.
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Steps in execution order.
    pub steps: Vec<PlannedStep>,
}

impl StrategyPlan {
    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the plan has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn contract_error(code: &str, step: &str, message: String) -> MapflowError {
    let mut info = ContractErrorInfo::new(code, message.clone()).with_context_entry("step", step);
    if let Some(hint) = ContractSuggestions::get(code) {
        info = info.with_fix_hint(hint);
    }
    ValidationError::new(message)
        .for_step(step)
        .with_error_info(info)
        .into()
}

/// Validates a strategy for a job.
///
/// Checks, in step order: unique step names, registered action types,
/// resolvable `${key}` dataset references, declared reads produced by an
/// earlier step or present in `initial_keys`, and writes to existing keys
/// declared as overwrites.
///
/// Unresolved `${parameters.X}` references and parameter schema errors do
/// not reject the strategy. They are kept on the [`PlannedStep`] and
/// surface when that step starts.
///
/// # Errors
///
/// `UnknownAction` for unregistered action types, `Validation` for
/// everything else. The first problem found is returned.
pub fn validate_strategy(
    definition: &StrategyDefinition,
    registry: &ActionRegistry,
    submitted: &BTreeMap<String, serde_json::Value>,
    initial_keys: &BTreeSet<String>,
) -> Result<StrategyPlan, MapflowError> {
    if definition.steps.is_empty() {
        return Err(contract_error(
            "STRATEGY-001-EMPTY",
            &definition.name,
            format!("Strategy '{}' has no steps", definition.name),
        ));
    }

    let parameters = definition.merge_parameters(submitted);
    let resolver = TemplateResolver::parameters_only(&parameters);
    let mut names = HashSet::new();
    let mut available = initial_keys.clone();
    let mut steps = Vec::with_capacity(definition.steps.len());

    for (index, step) in definition.steps.iter().enumerate() {
        let name = step.name.as_str();
        if !names.insert(name) {
            return Err(contract_error(
                "STRATEGY-005-DUPLICATE_STEP",
                name,
                format!("Step name '{name}' is used more than once"),
            ));
        }

        let descriptor = registry.descriptor(&step.action_type)?;

        for (param, value) in &step.params {
            for reference in references(value) {
                if let Reference::Dataset(key) = &reference {
                    if !available.contains(key) {
                        return Err(contract_error(
                            "STRATEGY-002-UNRESOLVED",
                            name,
                            format!("Step '{name}': parameter '{param}' references {reference}, which is not available"),
                        ));
                    }
                }
            }
        }

        let checked = resolver
            .resolve_params(&step.params)
            .map_err(|e| e.into_validation(name))
            .and_then(|resolved| {
                if resolved.values().any(has_dataset_references) {
                    descriptor.params.check_names(name, &resolved)?;
                    Ok(ValidatedParams::from_values(resolved))
                } else {
                    descriptor.params.validate(name, &resolved)
                }
            });
        let (access, param_error) = match checked {
            Ok(validated) => (descriptor.capabilities.resolve(name, &validated)?, None),
            Err(err) => {
                let raw = ValidatedParams::from_values(step.params.clone());
                let access = descriptor
                    .capabilities
                    .resolve(name, &raw)
                    .unwrap_or_else(|_| StepAccess::new(name));
                (access, Some(err))
            }
        };

        if let Some(missing) = access.reads.iter().find(|key| !available.contains(*key)) {
            return Err(contract_error(
                "STRATEGY-003-UNDECLARED_READ",
                name,
                format!("Step '{name}' reads dataset '{missing}', which no earlier step writes"),
            ));
        }
        if let Some(existing) = access
            .writes
            .iter()
            .find(|key| available.contains(*key) && !access.overwrites.contains(*key))
        {
            return Err(contract_error(
                "STRATEGY-004-OVERWRITE",
                name,
                format!(
                    "Step '{name}' writes dataset '{existing}', which already exists, without declaring an overwrite"
                ),
            ));
        }

        available.extend(access.writes.iter().cloned());
        available.extend(access.overwrites.iter().cloned());
        steps.push(PlannedStep {
            index,
            definition: step.clone(),
            access,
            param_error,
        });
    }

    Ok(StrategyPlan {
        name: definition.name.clone(),
        version: definition.version.clone(),
        parameters,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn load(name: &str, output: &str) -> StepDefinition {
        StepDefinition::new(name, "load_identifiers")
            .with_param("identifiers", json!(["P1"]))
            .with_param("output_key", json!(output))
    }

    fn check(definition: &StrategyDefinition) -> Result<StrategyPlan, MapflowError> {
        validate_strategy(
            definition,
            &ActionRegistry::with_builtins(),
            &BTreeMap::new(),
            &BTreeSet::new(),
        )
    }

    fn code(err: &MapflowError) -> Option<&str> {
        match err {
            MapflowError::Validation(v) => v.code(),
            _ => None,
        }
    }

    #[test]
    fn test_valid_strategy() {
        let definition = StrategyDefinition::new("s")
            .with_parameter("out", json!("merged"))
            .with_step(load("a", "ids_a"))
            .with_step(load("b", "ids_b"))
            .with_step(
                StepDefinition::new("merge", "merge_identifiers")
                    .with_param("input_keys", json!(["ids_a", "ids_b"]))
                    .with_param("output_key", json!("${parameters.out}")),
            );
        let plan = check(&definition).unwrap();
        assert_eq!(plan.len(), 3);
        assert!(plan.steps[2].access.writes.contains("merged"));
        assert!(plan.steps[2].access.reads.contains("ids_a"));
    }

    #[test]
    fn test_empty_strategy() {
        let err = check(&StrategyDefinition::new("s")).unwrap_err();
        assert_eq!(code(&err), Some("STRATEGY-001-EMPTY"));
    }

    #[test]
    fn test_unknown_action_is_fatal() {
        let definition = StrategyDefinition::new("s").with_step(StepDefinition::new("x", "teleport"));
        assert_eq!(check(&definition).unwrap_err().kind(), "unknown_action");
    }

    #[test]
    fn test_duplicate_step_names() {
        let definition = StrategyDefinition::new("s")
            .with_step(load("a", "x"))
            .with_step(load("a", "y"));
        assert_eq!(code(&check(&definition).unwrap_err()), Some("STRATEGY-005-DUPLICATE_STEP"));
    }

    #[test]
    fn test_missing_parameter() {
        let definition = StrategyDefinition::new("s").with_step(
            StepDefinition::new("a", "load_identifiers")
                .with_param("identifiers", json!("${parameters.ids}"))
                .with_param("output_key", json!("x")),
        );
        let plan = check(&definition).unwrap();
        let deferred = plan.steps[0].param_error.as_ref().unwrap();
        assert_eq!(deferred.code(), Some("STRATEGY-002-UNRESOLVED"));
        assert!(deferred.message.contains("${parameters.ids}"));

        let supplied = validate_strategy(
            &definition,
            &ActionRegistry::with_builtins(),
            &BTreeMap::from([("ids".to_string(), json!(["P1"]))]),
            &BTreeSet::new(),
        );
        assert!(supplied.unwrap().steps[0].param_error.is_none());
    }

    #[test]
    fn test_dataset_reference_must_be_produced_earlier() {
        let consumer = StepDefinition::new("b", "load_identifiers")
            .with_param("identifiers", json!("${ids_a}"))
            .with_param("output_key", json!("copy"));

        let before = StrategyDefinition::new("s").with_step(consumer.clone());
        assert_eq!(code(&check(&before).unwrap_err()), Some("STRATEGY-002-UNRESOLVED"));

        let after = StrategyDefinition::new("s")
            .with_step(load("a", "ids_a"))
            .with_step(consumer);
        assert!(check(&after).is_ok());
    }

    #[test]
    fn test_read_requires_earlier_write() {
        let definition = StrategyDefinition::new("s").with_step(
            StepDefinition::new("inv", "invert_mappings")
                .with_param("input_key", json!("forward"))
                .with_param("output_key", json!("reverse")),
        );
        assert_eq!(code(&check(&definition).unwrap_err()), Some("STRATEGY-003-UNDECLARED_READ"));

        let with_initial = validate_strategy(
            &definition,
            &ActionRegistry::with_builtins(),
            &BTreeMap::new(),
            &BTreeSet::from(["forward".to_string()]),
        );
        assert!(with_initial.is_ok());
    }

    #[test]
    fn test_write_to_existing_key() {
        let definition = StrategyDefinition::new("s")
            .with_step(load("a", "ids"))
            .with_step(load("b", "ids"));
        assert_eq!(code(&check(&definition).unwrap_err()), Some("STRATEGY-004-OVERWRITE"));
    }

    #[test]
    fn test_param_type_error_kept_on_step() {
        let definition = StrategyDefinition::new("s")
            .with_step(load("a", "ids"))
            .with_step(
                StepDefinition::new("b", "load_identifiers")
                    .with_param("identifiers", json!(42))
                    .with_param("output_key", json!("more_ids"))
                    .optional(),
            )
            .with_step(
                StepDefinition::new("c", "merge_identifiers")
                    .with_param("input_keys", json!(["ids", "more_ids"]))
                    .with_param("output_key", json!("all")),
            );
        let plan = check(&definition).unwrap();
        assert!(plan.steps[0].param_error.is_none());
        assert_eq!(
            plan.steps[1].param_error.as_ref().and_then(ValidationError::code),
            Some("PARAM-002-TYPE")
        );
        assert!(plan.steps[1].access.writes.contains("more_ids"));
        assert!(plan.steps[2].param_error.is_none());
    }

    #[test]
    fn test_param_type_error_does_not_hide_undeclared_read() {
        let definition = StrategyDefinition::new("s").with_step(
            StepDefinition::new("f", "filter_by_confidence")
                .with_param("input_key", json!("fwd"))
                .with_param("output_key", json!("out"))
                .with_param("min_confidence", json!("high")),
        );
        assert_eq!(code(&check(&definition).unwrap_err()), Some("STRATEGY-003-UNDECLARED_READ"));
    }
}
