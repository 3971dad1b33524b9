//! Typed datasets held in the execution context.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::reconcile::{MappingTable, ReconciliationOutput};

/// A value stored under a dataset key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Dataset {
    /// A list of identifiers.
    Identifiers(Vec<String>),
    /// A mapping table.
    Mappings(MappingTable),
    /// The output of a reconciliation.
    Reconciled(ReconciliationOutput),
    /// Free-form tabular records.
    Records(Vec<BTreeMap<String, serde_json::Value>>),
    /// Any other JSON value.
    Value(serde_json::Value),
}

impl Dataset {
    /// Short name of the variant, used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identifiers(_) => "identifiers",
            Self::Mappings(_) => "mappings",
            Self::Reconciled(_) => "reconciled",
            Self::Records(_) => "records",
            Self::Value(_) => "value",
        }
    }

    /// Number of items, or 1 for a plain value.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Identifiers(ids) => ids.len(),
            Self::Mappings(table) => table.len(),
            Self::Reconciled(output) => output.records.len(),
            Self::Records(records) => records.len(),
            Self::Value(_) => 1,
        }
    }

    /// Returns true if the dataset holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The identifiers, if this is an identifier list.
    #[must_use]
    pub fn as_identifiers(&self) -> Option<&[String]> {
        match self {
            Self::Identifiers(ids) => Some(ids),
            _ => None,
        }
    }

    /// The table, if this is a mapping table.
    #[must_use]
    pub fn as_mappings(&self) -> Option<&MappingTable> {
        match self {
            Self::Mappings(table) => Some(table),
            _ => None,
        }
    }

    /// The output, if this is a reconciliation output.
    #[must_use]
    pub fn as_reconciled(&self) -> Option<&ReconciliationOutput> {
        match self {
            Self::Reconciled(output) => Some(output),
            _ => None,
        }
    }

    /// JSON form of the payload, used when a template references the key.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Identifiers(ids) => serde_json::json!(ids),
            Self::Mappings(table) => serde_json::to_value(table).unwrap_or_default(),
            Self::Reconciled(output) => serde_json::to_value(output).unwrap_or_default(),
            Self::Records(records) => serde_json::json!(records),
            Self::Value(value) => value.clone(),
        }
    }
}

impl From<Vec<String>> for Dataset {
    fn from(ids: Vec<String>) -> Self {
        Self::Identifiers(ids)
    }
}

impl From<MappingTable> for Dataset {
    fn from(table: MappingTable) -> Self {
        Self::Mappings(table)
    }
}

impl From<ReconciliationOutput> for Dataset {
    fn from(output: ReconciliationOutput) -> Self {
        Self::Reconciled(output)
    }
}
