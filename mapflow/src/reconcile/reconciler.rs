//! The bidirectional reconciler.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::canonical::{select_canonical, verify_canonical, CanonicalGrouping};
use super::cardinality::{cardinality_flags, group_by_source, group_by_target, verify_cardinality};
use super::model::{
    MappingDirection, MappingRow, MappingSide, ReconcileRequest, ReconciledMapping,
    ReconciliationOutput, ReconciliationStats, UnmappedId, ValidationStatus,
};
use super::scoring::{ConfidencePolicy, Observation};
use crate::errors::MapflowError;

#[derive(Debug, Default)]
struct PairEvidence {
    forward: Option<Observation>,
    reverse: Option<Observation>,
}

fn observe(slot: &mut Option<Observation>, row: &MappingRow, path: Vec<String>) {
    match slot {
        Some(existing) => existing.merge(row.confidence, row.hop_count, &path),
        None => {
            *slot = Some(Observation {
                confidence: row.confidence,
                hop_count: row.hop_count,
                path,
            });
        }
    }
}

/// Merges a forward and a reverse mapping table into reconciled records.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BidirectionalReconciler {
    policy: ConfidencePolicy,
    grouping: CanonicalGrouping,
}

impl BidirectionalReconciler {
    /// Creates a reconciler with the default policy and source grouping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the confidence policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ConfidencePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the canonical grouping.
    #[must_use]
    pub fn with_grouping(mut self, grouping: CanonicalGrouping) -> Self {
        self.grouping = grouping;
        self
    }

    /// Reconciles the two tables of `request`.
    ///
    /// # Errors
    ///
    /// Returns [`MapflowError::ReconciliationInconsistency`] if the
    /// produced records fail the cardinality or canonical post-checks.
    pub fn reconcile(&self, request: &ReconcileRequest) -> Result<ReconciliationOutput, MapflowError> {
        let evidence = Self::collect_evidence(request);

        let pairs = || evidence.keys().map(|(s, t)| (s.as_str(), t.as_str()));
        let by_source = group_by_source(pairs());
        let by_target = group_by_target(pairs());

        let mut records: Vec<ReconciledMapping> = evidence
            .iter()
            .map(|((source, target), ev)| {
                let flags = cardinality_flags(source, target, &by_source, &by_target);
                let (validation_status, direction) = match (&ev.forward, &ev.reverse) {
                    (Some(_), Some(_)) => (ValidationStatus::Validated, MappingDirection::Bidirectional),
                    (Some(_), None) => (ValidationStatus::UnidirectionalSuccess, MappingDirection::Forward),
                    (None, _) => (ValidationStatus::UnidirectionalSuccess, MappingDirection::Reverse),
                };
                let best = ev.forward.as_ref().or(ev.reverse.as_ref());
                ReconciledMapping {
                    source_id: source.clone(),
                    target_id: target.clone(),
                    validation_status,
                    is_one_to_many_source: flags.one_to_many_source,
                    is_one_to_many_target: flags.one_to_many_target,
                    is_canonical_mapping: false,
                    confidence: self.policy.score(
                        ev.forward.as_ref(),
                        ev.reverse.as_ref(),
                        flags.one_to_many_source,
                    ),
                    hop_count: best.map_or(0, |o| o.hop_count),
                    mapping_path: best.map(|o| o.path.clone()).unwrap_or_default(),
                    direction,
                }
            })
            .collect();

        select_canonical(&mut records, self.grouping);
        verify_cardinality(&records)?;
        verify_canonical(&records, self.grouping)?;

        let unmapped = Self::unmapped(request, |id| by_source.contains(id), |id| by_target.contains(id));

        let stats = ReconciliationStats {
            total_records: records.len(),
            validated: records
                .iter()
                .filter(|r| r.validation_status == ValidationStatus::Validated)
                .count(),
            unidirectional: records
                .iter()
                .filter(|r| r.validation_status == ValidationStatus::UnidirectionalSuccess)
                .count(),
            one_to_many_sources: by_source.one_to_many_count(),
            one_to_many_targets: by_target.one_to_many_count(),
            canonical: records.iter().filter(|r| r.is_canonical_mapping).count(),
            unmapped_sources: unmapped.iter().filter(|u| u.side == MappingSide::Source).count(),
            unmapped_targets: unmapped.iter().filter(|u| u.side == MappingSide::Target).count(),
        };

        debug!(
            records = stats.total_records,
            validated = stats.validated,
            unmapped = unmapped.len(),
            "Reconciled mapping tables"
        );

        Ok(ReconciliationOutput {
            records,
            unmapped,
            stats,
        })
    }

    /// Keys every observed pair by `(source, target)`; the map order is
    /// the output order.
    fn collect_evidence(request: &ReconcileRequest) -> BTreeMap<(String, String), PairEvidence> {
        let mut evidence: BTreeMap<(String, String), PairEvidence> = BTreeMap::new();
        for row in request.forward.rows() {
            if row.from_id.is_empty() || row.to_id.is_empty() {
                continue;
            }
            let entry = evidence
                .entry((row.from_id.clone(), row.to_id.clone()))
                .or_default();
            observe(&mut entry.forward, row, row.path.clone());
        }
        for row in request.reverse.rows() {
            if row.from_id.is_empty() || row.to_id.is_empty() {
                continue;
            }
            // Reverse rows read target -> source.
            let entry = evidence
                .entry((row.to_id.clone(), row.from_id.clone()))
                .or_default();
            observe(&mut entry.reverse, row, row.path.iter().rev().cloned().collect());
        }
        evidence
    }

    fn unmapped(
        request: &ReconcileRequest,
        source_seen: impl Fn(&str) -> bool,
        target_seen: impl Fn(&str) -> bool,
    ) -> Vec<UnmappedId> {
        let sources: BTreeSet<&str> = request
            .requested_sources
            .iter()
            .map(String::as_str)
            .filter(|id| !source_seen(*id))
            .collect();
        let targets: BTreeSet<&str> = request
            .requested_targets
            .iter()
            .map(String::as_str)
            .filter(|id| !target_seen(*id))
            .collect();
        sources
            .into_iter()
            .map(|id| UnmappedId::new(id, MappingSide::Source))
            .chain(targets.into_iter().map(|id| UnmappedId::new(id, MappingSide::Target)))
            .collect()
    }
}

/// Reconciles with the default policy and source grouping.
pub fn reconcile(request: &ReconcileRequest) -> Result<ReconciliationOutput, MapflowError> {
    BidirectionalReconciler::new().reconcile(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::model::MappingTable;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn test_one_source_two_targets_scenario() {
        let forward = MappingTable::from_pairs([("p1", "t1"), ("p1", "t2")]);
        let reverse = MappingTable::from_pairs([("t1", "p1")]);
        let output = reconcile(&ReconcileRequest::new(forward, reverse)).unwrap();

        assert_eq!(output.records.len(), 2);

        let t1 = output.record("p1", "t1").unwrap();
        assert_eq!(t1.validation_status, ValidationStatus::Validated);
        assert!(t1.is_one_to_many_source);
        assert!(!t1.is_one_to_many_target);
        assert!(t1.is_canonical_mapping);
        assert_eq!(t1.direction, MappingDirection::Bidirectional);

        let t2 = output.record("p1", "t2").unwrap();
        assert_eq!(t2.validation_status, ValidationStatus::UnidirectionalSuccess);
        assert!(t2.is_one_to_many_source);
        assert!(!t2.is_one_to_many_target);
        assert!(!t2.is_canonical_mapping);
        assert_eq!(t2.direction, MappingDirection::Forward);
    }

    #[test]
    fn test_requested_source_absent_everywhere_is_unmapped() {
        let forward = MappingTable::from_pairs([("p1", "t1")]);
        let reverse = MappingTable::from_pairs([("t1", "p1")]);
        let request =
            ReconcileRequest::new(forward, reverse).with_requested_sources(["p1", "p9"]);
        let output = reconcile(&request).unwrap();

        assert_eq!(output.unmapped, vec![UnmappedId::new("p9", MappingSide::Source)]);
        assert!(output.records.iter().all(|r| r.source_id != "p9"));
        assert_eq!(output.stats.unmapped_sources, 1);
    }

    #[test]
    fn test_reverse_only_pair() {
        let reverse = MappingTable::from_pairs([("t5", "p5")]);
        let request = ReconcileRequest::new(MappingTable::new(), reverse)
            .with_requested_targets(["t5", "t6"]);
        let output = reconcile(&request).unwrap();

        let record = output.record("p5", "t5").unwrap();
        assert_eq!(record.direction, MappingDirection::Reverse);
        assert_eq!(record.validation_status, ValidationStatus::UnidirectionalSuccess);
        assert!((record.confidence - 0.9).abs() < 1e-9);
        assert_eq!(output.unmapped, vec![UnmappedId::new("t6", MappingSide::Target)]);
    }

    #[test]
    fn test_many_to_one_flags() {
        let forward = MappingTable::from_pairs([("p1", "t1"), ("p2", "t1")]);
        let output = reconcile(&ReconcileRequest::new(forward, MappingTable::new())).unwrap();
        for record in &output.records {
            assert!(!record.is_one_to_many_source);
            assert!(record.is_one_to_many_target);
            // Each source is its own canonical group.
            assert!(record.is_canonical_mapping);
        }
        assert_eq!(output.stats.one_to_many_targets, 1);
        assert_eq!(output.stats.one_to_many_sources, 0);
    }

    #[test]
    fn test_by_target_grouping_picks_one_source_per_target() {
        let forward = MappingTable::from_rows(vec![
            MappingRow::new("p1", "t1", 0.6),
            MappingRow::new("p2", "t1", 0.9),
        ]);
        let output = BidirectionalReconciler::new()
            .with_grouping(CanonicalGrouping::ByTarget)
            .reconcile(&ReconcileRequest::new(forward, MappingTable::new()))
            .unwrap();
        let canonical: Vec<_> = output.canonical().map(|r| r.source_id.as_str()).collect();
        assert_eq!(canonical, vec!["p2"]);
    }

    #[test]
    fn test_duplicate_rows_merge_into_one_record() {
        let forward = MappingTable::from_rows(vec![
            MappingRow::new("p1", "t1", 0.4).with_hops(3).with_path(["a", "b", "c", "d"]),
            MappingRow::new("p1", "t1", 0.7).with_hops(1).with_path(["a", "d"]),
        ]);
        let output = reconcile(&ReconcileRequest::new(forward, MappingTable::new())).unwrap();
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].hop_count, 1);
        assert_eq!(output.records[0].mapping_path, vec!["a", "d"]);
        assert!((output.records[0].confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_reverse_path_is_oriented_source_to_target() {
        let reverse = MappingTable::from_rows(vec![
            MappingRow::new("t1", "p1", 1.0).with_path(["hmdb", "uniprot"]),
        ]);
        let output = reconcile(&ReconcileRequest::new(MappingTable::new(), reverse)).unwrap();
        assert_eq!(output.records[0].mapping_path, vec!["uniprot", "hmdb"]);
    }

    #[test]
    fn test_empty_ids_are_ignored() {
        let forward = MappingTable::from_pairs([("", "t1"), ("p1", "")]);
        let output = reconcile(&ReconcileRequest::new(forward, MappingTable::new())).unwrap();
        assert!(output.records.is_empty());
    }

    #[test]
    fn test_records_sorted_by_source_then_target() {
        let forward = MappingTable::from_pairs([("p2", "t1"), ("p1", "t9"), ("p1", "t0")]);
        let output = reconcile(&ReconcileRequest::new(forward, MappingTable::new())).unwrap();
        let keys: Vec<_> = output
            .records
            .iter()
            .map(|r| (r.source_id.as_str(), r.target_id.as_str()))
            .collect();
        assert_eq!(keys, vec![("p1", "t0"), ("p1", "t9"), ("p2", "t1")]);
    }

    fn arb_pairs() -> impl Strategy<Value = Vec<(String, String)>> {
        prop::collection::vec(("p[0-4]", "t[0-4]"), 0..20)
    }

    fn table(pairs: &[(String, String)]) -> MappingTable {
        pairs
            .iter()
            .map(|(from, to)| MappingRow::new(from.clone(), to.clone(), 0.8))
            .collect()
    }

    proptest! {
        #[test]
        fn prop_source_flag_depends_only_on_source_grouping(
            forward in arb_pairs(),
            reverse in arb_pairs(),
        ) {
            let output = reconcile(&ReconcileRequest::new(table(&forward), table(&reverse))).unwrap();

            let mut targets_per_source: HashMap<&str, BTreeSet<&str>> = HashMap::new();
            let mut sources_per_target: HashMap<&str, BTreeSet<&str>> = HashMap::new();
            for r in &output.records {
                targets_per_source.entry(&r.source_id).or_default().insert(&r.target_id);
                sources_per_target.entry(&r.target_id).or_default().insert(&r.source_id);
            }
            for r in &output.records {
                prop_assert_eq!(r.is_one_to_many_source, targets_per_source[r.source_id.as_str()].len() > 1);
                prop_assert_eq!(r.is_one_to_many_target, sources_per_target[r.target_id.as_str()].len() > 1);
            }
        }

        #[test]
        fn prop_exactly_one_canonical_per_source(
            forward in arb_pairs(),
            reverse in arb_pairs(),
        ) {
            let output = reconcile(&ReconcileRequest::new(table(&forward), table(&reverse))).unwrap();
            let mut canonical: HashMap<&str, usize> = HashMap::new();
            for r in &output.records {
                let count = canonical.entry(&r.source_id).or_default();
                if r.is_canonical_mapping {
                    *count += 1;
                }
            }
            prop_assert!(canonical.values().all(|&n| n == 1));
        }

        #[test]
        fn prop_reconciliation_is_deterministic(
            forward in arb_pairs(),
            reverse in arb_pairs(),
        ) {
            let request = ReconcileRequest::new(table(&forward), table(&reverse));
            let first = reconcile(&request).unwrap();

            let mut shuffled_forward = forward.clone();
            shuffled_forward.reverse();
            let mut shuffled_reverse = reverse.clone();
            shuffled_reverse.reverse();
            let second = reconcile(&ReconcileRequest::new(table(&shuffled_forward), table(&shuffled_reverse))).unwrap();

            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_one_record_per_pair(
            forward in arb_pairs(),
            reverse in arb_pairs(),
        ) {
            let output = reconcile(&ReconcileRequest::new(table(&forward), table(&reverse))).unwrap();
            let distinct: BTreeSet<(String, String)> = forward
                .iter()
                .cloned()
                .chain(reverse.iter().map(|(t, s)| (s.clone(), t.clone())))
                .collect();
            prop_assert_eq!(output.records.len(), distinct.len());
        }
    }
}
