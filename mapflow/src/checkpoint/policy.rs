//! When and how checkpoints are taken.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::CheckpointKind;

fn default_true() -> bool {
    true
}

fn default_inline_threshold() -> usize {
    64 * 1024
}

fn default_retention_secs() -> Option<u64> {
    Some(7 * 24 * 60 * 60)
}

/// Checkpoint policy of the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    /// Snapshot the context before each step.
    #[serde(default = "default_true")]
    pub before_step: bool,
    /// Snapshot the context after each step, in the step's commit.
    #[serde(default = "default_true")]
    pub after_step: bool,
    /// Snapshot the pre-step context when a step fails.
    #[serde(default = "default_true")]
    pub on_error: bool,
    /// Payloads larger than this go to the external context store.
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold_bytes: usize,
    /// Compress externally stored payloads with zstd.
    #[serde(default = "default_true")]
    pub compress_external: bool,
    /// Checkpoints expire this many seconds after creation. `None` keeps
    /// them forever.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: Option<u64>,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            before_step: true,
            after_step: true,
            on_error: true,
            inline_threshold_bytes: default_inline_threshold(),
            compress_external: true,
            retention_secs: default_retention_secs(),
        }
    }
}

impl CheckpointPolicy {
    /// A policy that never checkpoints.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            before_step: false,
            after_step: false,
            on_error: false,
            ..Self::default()
        }
    }

    /// Sets the inline threshold.
    #[must_use]
    pub fn with_inline_threshold(mut self, bytes: usize) -> Self {
        self.inline_threshold_bytes = bytes;
        self
    }

    /// Sets the retention window.
    #[must_use]
    pub fn with_retention_secs(mut self, secs: Option<u64>) -> Self {
        self.retention_secs = secs;
        self
    }

    /// Returns true if the interpreter takes checkpoints of this kind.
    #[must_use]
    pub fn applies_to(&self, kind: CheckpointKind) -> bool {
        match kind {
            CheckpointKind::PreStep => self.before_step,
            CheckpointKind::PostStep => self.after_step,
            CheckpointKind::OnError => self.on_error,
            CheckpointKind::Automatic | CheckpointKind::Manual => true,
        }
    }

    /// Expiry of a checkpoint created at `created_at`.
    #[must_use]
    pub fn expiry_from(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.retention_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(Duration::try_seconds)
            .and_then(|window| created_at.checked_add_signed(window))
    }
}
