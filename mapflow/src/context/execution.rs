//! The shared execution context of a job.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Dataset;
use crate::errors::DataConflictError;

/// A file an action wrote, recorded for the job's results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    /// Dataset the file was produced from.
    pub dataset_key: String,
    /// Where the file lives.
    pub path: String,
    /// Format, e.g. "csv" or "json".
    pub format: String,
}

/// Datasets, statistics and output files shared by the steps of a job.
///
/// Owned by exactly one interpreter. Writing an existing dataset key
/// with [`ExecutionContext::put`] is a conflict; replacing one requires
/// [`ExecutionContext::put_overwrite`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default)]
    datasets: BTreeMap<String, Dataset>,
    #[serde(default)]
    statistics: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    output_files: Vec<OutputFile>,
}

impl ExecutionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dataset, replacing any previous value.
    #[must_use]
    pub fn with_dataset(mut self, key: impl Into<String>, dataset: impl Into<Dataset>) -> Self {
        self.datasets.insert(key.into(), dataset.into());
        self
    }

    /// Gets a dataset.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Dataset> {
        self.datasets.get(key)
    }

    /// Checks if a dataset key exists.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.datasets.contains_key(key)
    }

    /// Dataset keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    /// Number of datasets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    /// Returns true if no datasets are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Stores a dataset under a fresh key.
    ///
    /// # Errors
    ///
    /// Returns `DataConflictError` if the key already exists.
    pub fn put(&mut self, key: impl Into<String>, dataset: Dataset) -> Result<(), DataConflictError> {
        let key = key.into();
        if self.datasets.contains_key(&key) {
            return Err(DataConflictError::new(key));
        }
        self.datasets.insert(key, dataset);
        Ok(())
    }

    /// Stores a dataset, returning the value it replaced.
    pub fn put_overwrite(&mut self, key: impl Into<String>, dataset: Dataset) -> Option<Dataset> {
        self.datasets.insert(key.into(), dataset)
    }

    /// Records a statistic, replacing any previous value.
    pub fn record_statistic(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.statistics.insert(key.into(), value);
    }

    /// All statistics.
    #[must_use]
    pub fn statistics(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.statistics
    }

    /// Records an output file.
    pub fn add_output_file(&mut self, file: OutputFile) {
        self.output_files.push(file);
    }

    /// All output files.
    #[must_use]
    pub fn output_files(&self) -> &[OutputFile] {
        &self.output_files
    }

    /// Serializes the context for a checkpoint.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Restores a context from checkpoint bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
