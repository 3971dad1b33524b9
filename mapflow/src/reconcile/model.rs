//! Mapping tables and reconciled records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One observed mapping `from_id -> to_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRow {
    /// Identifier being mapped.
    pub from_id: String,
    /// Identifier it maps to.
    pub to_id: String,
    /// Confidence reported by the producing action, in `[0, 1]`.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Number of database hops the mapping went through.
    #[serde(default = "default_hops")]
    pub hop_count: u32,
    /// Names of the systems traversed, in order.
    #[serde(default)]
    pub path: Vec<String>,
}

fn default_confidence() -> f64 {
    1.0
}

fn default_hops() -> u32 {
    1
}

/// Clamps a confidence into `[0, 1]`. Non-finite values become 0.
#[must_use]
pub fn bounded_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl MappingRow {
    /// Creates a direct single-hop row. The confidence is bounded with
    /// [`bounded_confidence`].
    #[must_use]
    pub fn new(from_id: impl Into<String>, to_id: impl Into<String>, confidence: f64) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            confidence: bounded_confidence(confidence),
            hop_count: 1,
            path: Vec::new(),
        }
    }

    /// Sets the hop count.
    #[must_use]
    pub fn with_hops(mut self, hop_count: u32) -> Self {
        self.hop_count = hop_count;
        self
    }

    /// Sets the path.
    #[must_use]
    pub fn with_path<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path = path.into_iter().map(Into::into).collect();
        self
    }

    fn bounded(mut self) -> Self {
        self.confidence = bounded_confidence(self.confidence);
        self
    }

    /// Returns the same mapping read in the opposite direction.
    #[must_use]
    pub fn inverted(&self) -> Self {
        Self {
            from_id: self.to_id.clone(),
            to_id: self.from_id.clone(),
            confidence: self.confidence,
            hop_count: self.hop_count,
            path: self.path.iter().rev().cloned().collect(),
        }
    }
}

/// A table of mapping rows produced by one action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingTable {
    rows: Vec<MappingRow>,
}

impl MappingTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table from rows.
    #[must_use]
    pub fn from_rows(rows: Vec<MappingRow>) -> Self {
        rows.into_iter().collect()
    }

    /// Creates a table of direct rows with confidence 1.0 from `(from, to)` pairs.
    #[must_use]
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            rows: pairs
                .into_iter()
                .map(|(from, to)| MappingRow::new(from, to, 1.0))
                .collect(),
        }
    }

    /// Appends a row.
    pub fn push(&mut self, row: MappingRow) {
        self.rows.push(row.bounded());
    }

    /// The rows.
    #[must_use]
    pub fn rows(&self) -> &[MappingRow] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns the table read in the opposite direction.
    #[must_use]
    pub fn inverted(&self) -> Self {
        Self {
            rows: self.rows.iter().map(MappingRow::inverted).collect(),
        }
    }

    /// Returns the rows with `confidence >= min_confidence`.
    #[must_use]
    pub fn filter_min_confidence(&self, min_confidence: f64) -> Self {
        Self {
            rows: self
                .rows
                .iter()
                .filter(|row| row.confidence >= min_confidence)
                .cloned()
                .collect(),
        }
    }
}

impl FromIterator<MappingRow> for MappingTable {
    fn from_iter<T: IntoIterator<Item = MappingRow>>(iter: T) -> Self {
        Self {
            rows: iter.into_iter().map(MappingRow::bounded).collect(),
        }
    }
}

/// Agreement between the two directions for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    /// Seen forward and confirmed by the reverse table.
    Validated,
    /// Seen in one direction only.
    UnidirectionalSuccess,
    /// A requested id seen in neither direction. Never carried by a record.
    Failed,
}

impl ValidationStatus {
    /// Rank used for canonical selection; higher wins.
    #[must_use]
    pub fn tier(&self) -> u8 {
        match self {
            Self::Validated => 2,
            Self::UnidirectionalSuccess => 1,
            Self::Failed => 0,
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Validated => "validated",
            Self::UnidirectionalSuccess => "unidirectional_success",
            Self::Failed => "failed",
        })
    }
}

/// Which tables observed a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingDirection {
    /// Forward table only.
    Forward,
    /// Reverse table only.
    Reverse,
    /// Both tables.
    Bidirectional,
}

/// One reconciled `(source, target)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledMapping {
    /// Source identifier.
    pub source_id: String,
    /// Target identifier.
    pub target_id: String,
    /// Agreement between directions.
    pub validation_status: ValidationStatus,
    /// The source maps to more than one target.
    pub is_one_to_many_source: bool,
    /// The target is mapped from more than one source.
    pub is_one_to_many_target: bool,
    /// The preferred record of its canonical group.
    pub is_canonical_mapping: bool,
    /// Score in `[0, 1]`.
    pub confidence: f64,
    /// Hops of the best observed path.
    pub hop_count: u32,
    /// Systems traversed by the best observed path, source to target.
    pub mapping_path: Vec<String>,
    /// Which tables observed the pair.
    pub direction: MappingDirection,
}

/// Which side of the mapping a requested id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingSide {
    /// A source identifier.
    Source,
    /// A target identifier.
    Target,
}

/// A requested identifier that neither direction mapped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnmappedId {
    /// The identifier.
    pub id: String,
    /// Its side.
    pub side: MappingSide,
    /// Always [`ValidationStatus::Failed`].
    pub validation_status: ValidationStatus,
}

impl UnmappedId {
    /// Creates an unmapped entry.
    #[must_use]
    pub fn new(id: impl Into<String>, side: MappingSide) -> Self {
        Self {
            id: id.into(),
            side,
            validation_status: ValidationStatus::Failed,
        }
    }
}

/// Input of a reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileRequest {
    /// Rows `source -> target`.
    pub forward: MappingTable,
    /// Rows `target -> source`.
    pub reverse: MappingTable,
    /// Source ids the caller asked about.
    pub requested_sources: Vec<String>,
    /// Target ids the caller asked about.
    pub requested_targets: Vec<String>,
}

impl ReconcileRequest {
    /// Creates a request from the two tables.
    #[must_use]
    pub fn new(forward: MappingTable, reverse: MappingTable) -> Self {
        Self {
            forward,
            reverse,
            requested_sources: Vec::new(),
            requested_targets: Vec::new(),
        }
    }

    /// Sets the requested source ids.
    #[must_use]
    pub fn with_requested_sources<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_sources = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the requested target ids.
    #[must_use]
    pub fn with_requested_targets<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_targets = ids.into_iter().map(Into::into).collect();
        self
    }
}

/// Aggregate counts of a reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationStats {
    /// Records emitted.
    pub total_records: usize,
    /// Records with status `Validated`.
    pub validated: usize,
    /// Records with status `UnidirectionalSuccess`.
    pub unidirectional: usize,
    /// Distinct sources mapping to several targets.
    pub one_to_many_sources: usize,
    /// Distinct targets mapped from several sources.
    pub one_to_many_targets: usize,
    /// Records flagged canonical.
    pub canonical: usize,
    /// Requested sources left unmapped.
    pub unmapped_sources: usize,
    /// Requested targets left unmapped.
    pub unmapped_targets: usize,
}

/// Output of a reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationOutput {
    /// One record per distinct pair, sorted by (source, target).
    pub records: Vec<ReconciledMapping>,
    /// Requested ids absent from both directions.
    pub unmapped: Vec<UnmappedId>,
    /// Aggregate counts.
    pub stats: ReconciliationStats,
}

impl ReconciliationOutput {
    /// The canonical records only.
    pub fn canonical(&self) -> impl Iterator<Item = &ReconciledMapping> {
        self.records.iter().filter(|r| r.is_canonical_mapping)
    }

    /// Looks up the record of a pair.
    #[must_use]
    pub fn record(&self, source_id: &str, target_id: &str) -> Option<&ReconciledMapping> {
        self.records
            .iter()
            .find(|r| r.source_id == source_id && r.target_id == target_id)
    }

    /// The canonical records as a `source -> target` table.
    #[must_use]
    pub fn canonical_table(&self) -> MappingTable {
        self.canonical()
            .map(|r| MappingRow {
                from_id: r.source_id.clone(),
                to_id: r.target_id.clone(),
                confidence: r.confidence,
                hop_count: r.hop_count,
                path: r.mapping_path.clone(),
            })
            .collect()
    }
}
