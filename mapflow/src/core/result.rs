//! Action result types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counters reported by an action and persisted on its step row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Records the action looked at.
    #[serde(default)]
    pub records_processed: u64,
    /// Records that produced a mapping.
    #[serde(default)]
    pub records_matched: u64,
    /// Records that failed or stayed unmapped.
    #[serde(default)]
    pub records_failed: u64,
    /// Aggregate confidence of the produced mappings, if meaningful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Action specific counters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, f64>,
}

impl StepMetrics {
    /// Creates empty metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the processed count.
    #[must_use]
    pub fn with_processed(mut self, n: u64) -> Self {
        self.records_processed = n;
        self
    }

    /// Sets the matched count.
    #[must_use]
    pub fn with_matched(mut self, n: u64) -> Self {
        self.records_matched = n;
        self
    }

    /// Sets the failed count.
    #[must_use]
    pub fn with_failed(mut self, n: u64) -> Self {
        self.records_failed = n;
        self
    }

    /// Sets the confidence.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Adds an action specific counter.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: f64) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A named result an action wants persisted as a `ResultStorage` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultArtifact {
    /// Key, unique within the step.
    pub key: String,
    /// MIME type of the serialized payload.
    pub content_type: String,
    /// The payload.
    pub payload: serde_json::Value,
}

impl ResultArtifact {
    /// Creates a JSON artifact.
    #[must_use]
    pub fn json(key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            content_type: "application/json".to_string(),
            payload,
        }
    }
}

/// The outcome of a successful action execution.
///
/// Failures are reported through `ActionError` instead; `success` stays
/// true for every result the interpreter commits as completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the action considers its work successful.
    pub success: bool,
    /// Human readable summary.
    pub message: String,
    /// Counters for the step row.
    #[serde(default)]
    pub metrics: StepMetrics,
    /// Small summary values stored on the step row.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
    /// Artifacts to persist as result rows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ResultArtifact>,
}

impl Default for ActionResult {
    fn default() -> Self {
        Self::ok("")
    }
}

impl ActionResult {
    /// Creates a successful result with a message.
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            metrics: StepMetrics::default(),
            data: BTreeMap::new(),
            artifacts: Vec::new(),
        }
    }

    /// Sets the metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: StepMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Adds a summary value.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Adds an artifact.
    #[must_use]
    pub fn with_artifact(mut self, artifact: ResultArtifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// The summary stored in `ExecutionStep::output_summary`.
    #[must_use]
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "message": self.message,
            "data": self.data,
            "artifacts": self.artifacts.iter().map(|a| a.key.as_str()).collect::<Vec<_>>(),
        })
    }
}
