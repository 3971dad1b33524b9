//! Error types for the mapflow execution core.
//!
//! The taxonomy mirrors the failure classes a strategy run can hit:
//! validation of strategies and parameters, action resolution and
//! execution, checkpoint persistence, and reconciliation invariants.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::store::StoreError;

/// The main error type for mapflow operations.
#[derive(Debug, Error)]
pub enum MapflowError {
    /// Bad strategy or step parameters. Fatal to the step, never retried.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// A strategy references an action type that is not registered.
    #[error("Unknown action type: '{action_type}'")]
    UnknownAction {
        /// The unresolved action type.
        action_type: String,
    },

    /// An action type was registered twice.
    #[error("Action type already registered: '{action_type}'")]
    DuplicateAction {
        /// The duplicated action type.
        action_type: String,
    },

    /// An action failed while executing.
    #[error("{0}")]
    ActionExecution(#[from] ActionError),

    /// Persisting or loading a checkpoint failed.
    #[error("{0}")]
    Checkpoint(#[from] CheckpointError),

    /// The reconciler produced data violating a cardinality invariant.
    #[error("Reconciliation inconsistency: {0}")]
    ReconciliationInconsistency(String),

    /// A step touched a dataset key it did not declare.
    #[error("{0}")]
    UndeclaredAccess(#[from] UndeclaredAccessError),

    /// A step wrote an existing dataset key without declaring an overwrite.
    #[error("{0}")]
    DataConflict(#[from] DataConflictError),

    /// A job or step status transition violated the state machine.
    #[error("Invalid status transition from '{from}' to '{to}'")]
    InvalidTransition {
        /// The current status.
        from: String,
        /// The requested status.
        to: String,
    },

    /// The job store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// No job exists with the given identifier.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// No strategy exists with the given name.
    #[error("Strategy not found: '{0}'")]
    StrategyNotFound(String),

    /// The job was cancelled.
    #[error("Job cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MapflowError {
    /// Creates an unknown action error.
    #[must_use]
    pub fn unknown_action(action_type: impl Into<String>) -> Self {
        Self::UnknownAction {
            action_type: action_type.into(),
        }
    }

    /// Creates a duplicate action error.
    #[must_use]
    pub fn duplicate_action(action_type: impl Into<String>) -> Self {
        Self::DuplicateAction {
            action_type: action_type.into(),
        }
    }

    /// Creates an invalid transition error.
    #[must_use]
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Returns true if a step failing with this error may be re-attempted.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ActionExecution(err) => err.retryable,
            _ => false,
        }
    }

    /// Short machine-readable name of the error class.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::UnknownAction { .. } => "unknown_action",
            Self::DuplicateAction { .. } => "duplicate_action",
            Self::ActionExecution(_) => "action_execution",
            Self::Checkpoint(_) => "checkpoint",
            Self::ReconciliationInconsistency(_) => "reconciliation_inconsistency",
            Self::UndeclaredAccess(_) => "undeclared_access",
            Self::DataConflict(_) => "data_conflict",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Store(_) => "store",
            Self::JobNotFound(_) => "job_not_found",
            Self::StrategyNotFound(_) => "strategy_not_found",
            Self::Cancelled(_) => "cancelled",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for MapflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "STRATEGY-002-UNRESOLVED").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a strategy, a step, or its parameters fail validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// The error message.
    pub message: String,
    /// The steps involved in the error.
    pub steps: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            steps: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the step involved.
    #[must_use]
    pub fn for_step(mut self, step: impl Into<String>) -> Self {
        self.steps = vec![step.into()];
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the contract error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error returned by an action's `execute`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Action execution failed: {message}")]
pub struct ActionError {
    /// Human readable failure message.
    pub message: String,
    /// Whether re-running the step may succeed.
    pub retryable: bool,
}

impl ActionError {
    /// A failure that may succeed on retry (e.g. an upstream API timeout).
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not succeed on retry.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Error raised while snapshotting or restoring execution state.
///
/// Prior checkpoints are never modified by a failed write.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Serializing or deserializing the context failed.
    #[error("checkpoint serialization failed: {0}")]
    Serialization(String),

    /// Compressing or decompressing an external payload failed.
    #[error("checkpoint compression failed: {0}")]
    Compression(String),

    /// The external blob store failed.
    #[error("checkpoint blob storage failed: {0}")]
    Blob(String),

    /// The job store failed while persisting the checkpoint row.
    #[error("checkpoint persistence failed: {0}")]
    Store(#[from] StoreError),

    /// No resumable checkpoint exists for the job.
    #[error("no resumable checkpoint for job {0}")]
    NotResumable(String),
}

/// Error raised when a step touches a dataset key it did not declare.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Undeclared {access}: step '{step}' attempted to {access} dataset '{key}' which it did not declare")]
pub struct UndeclaredAccessError {
    /// The step attempting access.
    pub step: String,
    /// The undeclared key.
    pub key: String,
    /// "read" or "write".
    pub access: &'static str,
}

impl UndeclaredAccessError {
    /// Creates an undeclared read error.
    #[must_use]
    pub fn read(step: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            key: key.into(),
            access: "read",
        }
    }

    /// Creates an undeclared write error.
    #[must_use]
    pub fn write(step: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            key: key.into(),
            access: "write",
        }
    }
}

/// Error raised when writing to an existing dataset key without overwrite rights.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Data conflict: dataset '{key}' already exists")]
pub struct DataConflictError {
    /// The conflicting key.
    pub key: String,
}

impl DataConflictError {
    /// Creates a new data conflict error.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Default suggestions for strategy contract error codes.
pub struct ContractSuggestions;

impl ContractSuggestions {
    /// Gets a suggestion for a given error code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            "STRATEGY-001-EMPTY" => Some("Add at least one step to the strategy."),
            "STRATEGY-002-UNRESOLVED" => Some(
                "Supply the parameter when submitting the job, give it a default in the \
                 strategy's `parameters` block, or reference a dataset written by an earlier step.",
            ),
            "STRATEGY-003-UNDECLARED_READ" => Some(
                "Make sure an earlier step writes the dataset, or pass it in as an initial dataset.",
            ),
            "STRATEGY-004-OVERWRITE" => Some(
                "Use a fresh dataset key, or use an action that declares the key as an overwrite.",
            ),
            "STRATEGY-005-DUPLICATE_STEP" => Some("Give every step a unique name."),
            "PARAM-001-MISSING" | "PARAM-002-TYPE" | "PARAM-003-UNKNOWN" => Some(
                "Check the step's params against the action's declared parameter schema.",
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_error_info_creation() {
        let info = ContractErrorInfo::new("STRATEGY-002-UNRESOLVED", "Unresolved reference")
            .with_fix_hint("Supply it")
            .with_context_entry("step", "load");

        assert_eq!(info.code, "STRATEGY-002-UNRESOLVED");
        assert_eq!(info.fix_hint, Some("Supply it".to_string()));
        assert_eq!(info.context.get("step"), Some(&"load".to_string()));
    }

    #[test]
    fn test_validation_error_code() {
        let err = ValidationError::new("bad")
            .for_step("load")
            .with_error_info(ContractErrorInfo::new("PARAM-001-MISSING", "missing"));

        assert_eq!(err.code(), Some("PARAM-001-MISSING"));
        assert_eq!(err.steps, vec!["load".to_string()]);
    }

    #[test]
    fn test_retryability() {
        let transient: MapflowError = ActionError::transient("timeout").into();
        let permanent: MapflowError = ActionError::permanent("bad input").into();
        let validation: MapflowError = ValidationError::new("nope").into();

        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(!validation.is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(MapflowError::unknown_action("x").kind(), "unknown_action");
        assert_eq!(
            MapflowError::ReconciliationInconsistency("x".into()).kind(),
            "reconciliation_inconsistency"
        );
    }

    #[test]
    fn test_undeclared_access_message() {
        let err = UndeclaredAccessError::read("merge", "proteins");
        assert!(err.to_string().contains("step 'merge'"));
        assert!(err.to_string().contains("read dataset 'proteins'"));
    }

    #[test]
    fn test_contract_suggestions() {
        assert!(ContractSuggestions::get("STRATEGY-002-UNRESOLVED").is_some());
        assert!(ContractSuggestions::get("UNKNOWN").is_none());
    }
}
