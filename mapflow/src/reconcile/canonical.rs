//! Canonical record selection.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::model::ReconciledMapping;
use crate::errors::MapflowError;

/// How records are grouped before picking one canonical record per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalGrouping {
    /// One canonical target per source.
    #[default]
    BySource,
    /// One canonical source per target, for many-to-one strategies.
    ByTarget,
}

impl CanonicalGrouping {
    fn key<'a>(&self, record: &'a ReconciledMapping) -> &'a str {
        match self {
            Self::BySource => &record.source_id,
            Self::ByTarget => &record.target_id,
        }
    }
}

/// Orders records best first: validation tier, confidence, fewer hops,
/// then `(target, source)` lexicographically.
#[must_use]
pub fn rank(a: &ReconciledMapping, b: &ReconciledMapping) -> Ordering {
    b.validation_status
        .tier()
        .cmp(&a.validation_status.tier())
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.hop_count.cmp(&b.hop_count))
        .then_with(|| a.target_id.cmp(&b.target_id))
        .then_with(|| a.source_id.cmp(&b.source_id))
}

/// Sets `is_canonical_mapping` on exactly one record per group.
///
/// The result does not depend on the order of `records`.
pub fn select_canonical(records: &mut [ReconciledMapping], grouping: CanonicalGrouping) {
    let mut best: BTreeMap<&str, usize> = BTreeMap::new();
    for (idx, record) in records.iter().enumerate() {
        let key = grouping.key(record);
        match best.get(key) {
            Some(&current) if rank(record, &records[current]) != Ordering::Less => {}
            _ => {
                best.insert(key, idx);
            }
        }
    }
    let winners: Vec<usize> = best.into_values().collect();
    for record in records.iter_mut() {
        record.is_canonical_mapping = false;
    }
    for idx in winners {
        records[idx].is_canonical_mapping = true;
    }
}

/// Checks that every group has exactly one canonical record.
pub fn verify_canonical(
    records: &[ReconciledMapping],
    grouping: CanonicalGrouping,
) -> Result<(), MapflowError> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in records {
        let count = counts.entry(grouping.key(record)).or_default();
        if record.is_canonical_mapping {
            *count += 1;
        }
    }
    match counts.iter().find(|(_, &n)| n != 1) {
        Some((key, n)) => Err(MapflowError::ReconciliationInconsistency(format!(
            "group '{key}' has {n} canonical records"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::model::{MappingDirection, ValidationStatus};

    fn record(source: &str, target: &str, status: ValidationStatus, confidence: f64, hops: u32) -> ReconciledMapping {
        ReconciledMapping {
            source_id: source.into(),
            target_id: target.into(),
            validation_status: status,
            is_one_to_many_source: false,
            is_one_to_many_target: false,
            is_canonical_mapping: false,
            confidence,
            hop_count: hops,
            mapping_path: Vec::new(),
            direction: MappingDirection::Forward,
        }
    }

    fn canonical_targets(records: &[ReconciledMapping]) -> Vec<(String, String)> {
        records
            .iter()
            .filter(|r| r.is_canonical_mapping)
            .map(|r| (r.source_id.clone(), r.target_id.clone()))
            .collect()
    }

    #[test]
    fn test_tier_beats_confidence() {
        let mut records = vec![
            record("p1", "t1", ValidationStatus::UnidirectionalSuccess, 0.99, 1),
            record("p1", "t2", ValidationStatus::Validated, 0.5, 1),
        ];
        select_canonical(&mut records, CanonicalGrouping::BySource);
        assert_eq!(canonical_targets(&records), vec![("p1".into(), "t2".into())]);
    }

    #[test]
    fn test_confidence_then_hops_then_lexicographic() {
        let v = ValidationStatus::Validated;
        let mut records = vec![
            record("p1", "t3", v, 0.8, 2),
            record("p1", "t2", v, 0.8, 1),
            record("p1", "t1", v, 0.7, 1),
        ];
        select_canonical(&mut records, CanonicalGrouping::BySource);
        assert_eq!(canonical_targets(&records), vec![("p1".into(), "t2".into())]);

        let mut tied = vec![record("p1", "tb", v, 0.8, 1), record("p1", "ta", v, 0.8, 1)];
        select_canonical(&mut tied, CanonicalGrouping::BySource);
        assert_eq!(canonical_targets(&tied), vec![("p1".into(), "ta".into())]);
    }

    #[test]
    fn test_selection_ignores_input_order() {
        let v = ValidationStatus::Validated;
        let mut forward = vec![record("p1", "ta", v, 0.8, 1), record("p1", "tb", v, 0.8, 1)];
        let mut backward = vec![record("p1", "tb", v, 0.8, 1), record("p1", "ta", v, 0.8, 1)];
        select_canonical(&mut forward, CanonicalGrouping::BySource);
        select_canonical(&mut backward, CanonicalGrouping::BySource);
        assert_eq!(canonical_targets(&forward), canonical_targets(&backward));
    }

    #[test]
    fn test_by_target_grouping() {
        let v = ValidationStatus::Validated;
        let mut records = vec![
            record("p1", "t1", v, 0.6, 1),
            record("p2", "t1", v, 0.9, 1),
            record("p2", "t2", v, 0.9, 1),
        ];
        select_canonical(&mut records, CanonicalGrouping::ByTarget);
        assert_eq!(
            canonical_targets(&records),
            vec![("p2".into(), "t1".into()), ("p2".into(), "t2".into())]
        );
        assert!(verify_canonical(&records, CanonicalGrouping::ByTarget).is_ok());
    }

    #[test]
    fn test_verify_detects_missing_canonical() {
        let records = vec![record("p1", "t1", ValidationStatus::Validated, 1.0, 1)];
        assert!(verify_canonical(&records, CanonicalGrouping::BySource).is_err());
    }

    #[test]
    fn test_reselection_clears_previous_flags() {
        let v = ValidationStatus::Validated;
        let mut records = vec![record("p1", "t1", v, 0.1, 1), record("p1", "t2", v, 0.9, 1)];
        records[0].is_canonical_mapping = true;
        select_canonical(&mut records, CanonicalGrouping::BySource);
        assert!(!records[0].is_canonical_mapping);
        assert!(records[1].is_canonical_mapping);
    }
}
