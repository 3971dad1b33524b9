//! Bidirectional mapping reconciliation.
//!
//! Given a forward table (`source -> target`) and an independently
//! computed reverse table (`target -> source`), produces one record per
//! distinct `(source, target)` pair with:
//!
//! - a validation status (`Validated` when both directions agree),
//! - cardinality flags computed over the complete groupings,
//! - exactly one canonical record per group,
//! - a policy-driven confidence score.
//!
//! Requested ids missing from both tables are reported as unmapped.

mod canonical;
mod cardinality;
mod model;
mod reconciler;
mod scoring;

pub use canonical::{rank, select_canonical, verify_canonical, CanonicalGrouping};
pub use cardinality::{
    cardinality_flags, group_by_source, group_by_target, verify_cardinality, CardinalityFlags,
    SourceGrouping, TargetGrouping,
};
pub use model::{
    bounded_confidence, MappingDirection, MappingRow, MappingSide, MappingTable, ReconcileRequest, ReconciledMapping,
    ReconciliationOutput, ReconciliationStats, UnmappedId, ValidationStatus,
};
pub use reconciler::{reconcile, BidirectionalReconciler};
pub use scoring::{ConfidencePolicy, Observation};
