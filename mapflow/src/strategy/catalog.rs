//! Named strategies available to the job service.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use super::StrategyDefinition;
use crate::errors::MapflowError;

/// Strategies by name.
///
/// Registration may happen while jobs run; lookups hand out `Arc`s so a
/// running job keeps the definition it started with.
#[derive(Debug, Default)]
pub struct StrategyCatalog {
    strategies: RwLock<HashMap<String, Arc<StrategyDefinition>>>,
}

impl StrategyCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a strategy, returning the definition it replaced.
    pub fn register(&self, definition: StrategyDefinition) -> Option<Arc<StrategyDefinition>> {
        self.strategies
            .write()
            .insert(definition.name.clone(), Arc::new(definition))
    }

    /// Looks up a strategy.
    ///
    /// # Errors
    ///
    /// Returns `StrategyNotFound` if no strategy has that name.
    pub fn get(&self, name: &str) -> Result<Arc<StrategyDefinition>, MapflowError> {
        self.strategies
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MapflowError::StrategyNotFound(name.to_string()))
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Loads every `.yaml`, `.yml` and `.json` file of a directory.
    ///
    /// Returns the number of strategies loaded.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> anyhow::Result<usize> {
        let dir = dir.as_ref();
        let mut loaded = 0;
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("reading strategy directory {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            let is_strategy = matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("yaml" | "yml" | "json")
            );
            if !is_strategy {
                continue;
            }
            let definition = StrategyDefinition::from_path(&path)?;
            info!(strategy = %definition.name, path = %path.display(), "Loaded strategy");
            self.register(definition);
            loaded += 1;
        }
        Ok(loaded)
    }
}
