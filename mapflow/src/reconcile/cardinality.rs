//! Cardinality groupings and flags.
//!
//! The source-side flag is only ever read from a [`SourceGrouping`] and
//! the target-side flag only from a [`TargetGrouping`]. Both go through
//! [`cardinality_flags`]; no other code computes them.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::model::ReconciledMapping;
use crate::errors::MapflowError;

/// Source id to the set of target ids it maps to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceGrouping(BTreeMap<String, BTreeSet<String>>);

impl SourceGrouping {
    /// Targets of a source.
    #[must_use]
    pub fn targets_of(&self, source_id: &str) -> Option<&BTreeSet<String>> {
        self.0.get(source_id)
    }

    /// Number of distinct sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no pairs were grouped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if the source appears in any pair.
    #[must_use]
    pub fn contains(&self, source_id: &str) -> bool {
        self.0.contains_key(source_id)
    }

    /// Number of sources with more than one target.
    #[must_use]
    pub fn one_to_many_count(&self) -> usize {
        self.0.values().filter(|t| is_one_to_many(Some(t))).count()
    }
}

/// Target id to the set of source ids mapping to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetGrouping(BTreeMap<String, BTreeSet<String>>);

impl TargetGrouping {
    /// Sources of a target.
    #[must_use]
    pub fn sources_of(&self, target_id: &str) -> Option<&BTreeSet<String>> {
        self.0.get(target_id)
    }

    /// Number of distinct targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no pairs were grouped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if the target appears in any pair.
    #[must_use]
    pub fn contains(&self, target_id: &str) -> bool {
        self.0.contains_key(target_id)
    }

    /// Number of targets with more than one source.
    #[must_use]
    pub fn one_to_many_count(&self) -> usize {
        self.0.values().filter(|s| is_one_to_many(Some(s))).count()
    }
}

/// Groups `(source, target)` pairs by source.
pub fn group_by_source<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> SourceGrouping {
    let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (source, target) in pairs {
        map.entry(source.to_string())
            .or_default()
            .insert(target.to_string());
    }
    SourceGrouping(map)
}

/// Groups `(source, target)` pairs by target.
pub fn group_by_target<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> TargetGrouping {
    let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (source, target) in pairs {
        map.entry(target.to_string())
            .or_default()
            .insert(source.to_string());
    }
    TargetGrouping(map)
}

fn is_one_to_many(members: Option<&BTreeSet<String>>) -> bool {
    members.is_some_and(|m| m.len() > 1)
}

/// The two cardinality flags of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CardinalityFlags {
    /// The source maps to more than one target.
    pub one_to_many_source: bool,
    /// The target is mapped from more than one source.
    pub one_to_many_target: bool,
}

/// Computes the flags of `(source_id, target_id)` from the complete groupings.
#[must_use]
pub fn cardinality_flags(
    source_id: &str,
    target_id: &str,
    by_source: &SourceGrouping,
    by_target: &TargetGrouping,
) -> CardinalityFlags {
    CardinalityFlags {
        one_to_many_source: is_one_to_many(by_source.targets_of(source_id)),
        one_to_many_target: is_one_to_many(by_target.sources_of(target_id)),
    }
}

/// Recomputes every record's flags from the records themselves.
///
/// Fails on duplicate pairs or on any flag that disagrees with the
/// recomputed groupings.
pub fn verify_cardinality(records: &[ReconciledMapping]) -> Result<(), MapflowError> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if !seen.insert((record.source_id.as_str(), record.target_id.as_str())) {
            return Err(MapflowError::ReconciliationInconsistency(format!(
                "duplicate record for pair ({}, {})",
                record.source_id, record.target_id
            )));
        }
    }

    let pairs = || {
        records
            .iter()
            .map(|r| (r.source_id.as_str(), r.target_id.as_str()))
    };
    let by_source = group_by_source(pairs());
    let by_target = group_by_target(pairs());

    for record in records {
        let expected = cardinality_flags(&record.source_id, &record.target_id, &by_source, &by_target);
        if expected.one_to_many_source != record.is_one_to_many_source
            || expected.one_to_many_target != record.is_one_to_many_target
        {
            return Err(MapflowError::ReconciliationInconsistency(format!(
                "cardinality flags of ({}, {}) are (source={}, target={}), expected (source={}, target={})",
                record.source_id,
                record.target_id,
                record.is_one_to_many_source,
                record.is_one_to_many_target,
                expected.one_to_many_source,
                expected.one_to_many_target,
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::model::{MappingDirection, ValidationStatus};

    fn record(source: &str, target: &str, src_flag: bool, tgt_flag: bool) -> ReconciledMapping {
        ReconciledMapping {
            source_id: source.into(),
            target_id: target.into(),
            validation_status: ValidationStatus::Validated,
            is_one_to_many_source: src_flag,
            is_one_to_many_target: tgt_flag,
            is_canonical_mapping: false,
            confidence: 1.0,
            hop_count: 1,
            mapping_path: Vec::new(),
            direction: MappingDirection::Bidirectional,
        }
    }

    #[test]
    fn test_groupings_are_independent() {
        let pairs = [("p1", "t1"), ("p1", "t2"), ("p2", "t1")];
        let by_source = group_by_source(pairs);
        let by_target = group_by_target(pairs);

        assert_eq!(by_source.targets_of("p1").map(BTreeSet::len), Some(2));
        assert_eq!(by_target.sources_of("t1").map(BTreeSet::len), Some(2));
        assert_eq!(by_source.one_to_many_count(), 1);
        assert_eq!(by_target.one_to_many_count(), 1);

        // p2 -> t1: p2 has one target, t1 has two sources.
        let flags = cardinality_flags("p2", "t1", &by_source, &by_target);
        assert!(!flags.one_to_many_source);
        assert!(flags.one_to_many_target);

        // p1 -> t2: p1 has two targets, t2 has one source.
        let flags = cardinality_flags("p1", "t2", &by_source, &by_target);
        assert!(flags.one_to_many_source);
        assert!(!flags.one_to_many_target);
    }

    #[test]
    fn test_duplicate_pairs_collapse_in_grouping() {
        let by_source = group_by_source([("p1", "t1"), ("p1", "t1")]);
        assert_eq!(by_source.targets_of("p1").map(BTreeSet::len), Some(1));
    }

    #[test]
    fn test_verify_accepts_correct_flags() {
        let records = vec![record("p1", "t1", true, false), record("p1", "t2", true, false)];
        assert!(verify_cardinality(&records).is_ok());
    }

    #[test]
    fn test_verify_rejects_swapped_flags() {
        let records = vec![record("p1", "t1", false, true), record("p1", "t2", false, true)];
        let err = verify_cardinality(&records).unwrap_err();
        assert_eq!(err.kind(), "reconciliation_inconsistency");
    }

    #[test]
    fn test_verify_rejects_duplicate_pairs() {
        let records = vec![record("p1", "t1", false, false), record("p1", "t1", false, false)];
        assert!(verify_cardinality(&records).is_err());
    }
}
