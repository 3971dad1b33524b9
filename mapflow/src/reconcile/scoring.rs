//! Confidence scoring policy.

use serde::{Deserialize, Serialize};

use super::model::bounded_confidence;

/// What one table observed about a pair, after merging duplicate rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Highest confidence among the merged rows.
    pub confidence: f64,
    /// Fewest hops among the merged rows.
    pub hop_count: u32,
    /// Path of the fewest-hop row, oriented source to target.
    pub path: Vec<String>,
}

impl Observation {
    /// Folds another row for the same pair into this observation.
    pub fn merge(&mut self, confidence: f64, hop_count: u32, path: &[String]) {
        if confidence > self.confidence {
            self.confidence = confidence;
        }
        if hop_count < self.hop_count {
            self.hop_count = hop_count;
            self.path = path.to_vec();
        }
    }
}

/// Weights of the confidence formula.
///
/// ```text
/// score = base
///       - hop_penalty * (hops - 1)
///       - reverse_only_penalty   (reverse table only)
///       - ambiguity_penalty      (source has several targets)
///       + validation_bonus       (both tables agree)
/// ```
///
/// `base` is the forward observation's confidence, or the reverse one's
/// if the forward table never saw the pair. The result is clamped to
/// `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidencePolicy {
    /// Subtracted per hop beyond the first.
    #[serde(default = "default_hop_penalty")]
    pub hop_penalty: f64,
    /// Subtracted when only the reverse table saw the pair.
    #[serde(default = "default_reverse_only_penalty")]
    pub reverse_only_penalty: f64,
    /// Subtracted when the source has several candidate targets.
    #[serde(default = "default_ambiguity_penalty")]
    pub ambiguity_penalty: f64,
    /// Added when both tables saw the pair.
    #[serde(default = "default_validation_bonus")]
    pub validation_bonus: f64,
}

fn default_hop_penalty() -> f64 {
    0.05
}

fn default_reverse_only_penalty() -> f64 {
    0.1
}

fn default_ambiguity_penalty() -> f64 {
    0.1
}

fn default_validation_bonus() -> f64 {
    0.1
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            hop_penalty: default_hop_penalty(),
            reverse_only_penalty: default_reverse_only_penalty(),
            ambiguity_penalty: default_ambiguity_penalty(),
            validation_bonus: default_validation_bonus(),
        }
    }
}

impl ConfidencePolicy {
    /// Sets the hop penalty.
    #[must_use]
    pub fn with_hop_penalty(mut self, penalty: f64) -> Self {
        self.hop_penalty = penalty;
        self
    }

    /// Sets the reverse-only penalty.
    #[must_use]
    pub fn with_reverse_only_penalty(mut self, penalty: f64) -> Self {
        self.reverse_only_penalty = penalty;
        self
    }

    /// Sets the ambiguity penalty.
    #[must_use]
    pub fn with_ambiguity_penalty(mut self, penalty: f64) -> Self {
        self.ambiguity_penalty = penalty;
        self
    }

    /// Sets the validation bonus.
    #[must_use]
    pub fn with_validation_bonus(mut self, bonus: f64) -> Self {
        self.validation_bonus = bonus;
        self
    }

    /// Scores a pair. At least one observation must be present; a pair
    /// with neither scores 0.
    #[must_use]
    pub fn score(
        &self,
        forward: Option<&Observation>,
        reverse: Option<&Observation>,
        one_to_many_source: bool,
    ) -> f64 {
        let Some(primary) = forward.or(reverse) else {
            return 0.0;
        };
        let mut score = primary.confidence;
        score -= self.hop_penalty * f64::from(primary.hop_count.saturating_sub(1));
        if forward.is_none() {
            score -= self.reverse_only_penalty;
        }
        if one_to_many_source {
            score -= self.ambiguity_penalty;
        }
        if forward.is_some() && reverse.is_some() {
            score += self.validation_bonus;
        }
        bounded_confidence(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(confidence: f64, hops: u32) -> Observation {
        Observation {
            confidence,
            hop_count: hops,
            path: Vec::new(),
        }
    }

    #[test]
    fn test_shorter_paths_score_higher() {
        let policy = ConfidencePolicy::default();
        let short = policy.score(Some(&obs(0.8, 1)), None, false);
        let long = policy.score(Some(&obs(0.8, 3)), None, false);
        assert!(short > long);
        assert!((short - long - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_reverse_only_penalized() {
        let policy = ConfidencePolicy::default();
        let forward = policy.score(Some(&obs(0.8, 1)), None, false);
        let reverse = policy.score(None, Some(&obs(0.8, 1)), false);
        assert!(forward > reverse);
    }

    #[test]
    fn test_unique_candidate_scores_higher() {
        let policy = ConfidencePolicy::default();
        let unique = policy.score(Some(&obs(0.8, 1)), None, false);
        let ambiguous = policy.score(Some(&obs(0.8, 1)), None, true);
        assert!(unique > ambiguous);
    }

    #[test]
    fn test_validated_bonus_and_clamp() {
        let policy = ConfidencePolicy::default();
        let both = policy.score(Some(&obs(0.95, 1)), Some(&obs(0.5, 1)), false);
        assert!((both - 1.0).abs() < f64::EPSILON);

        let floor = ConfidencePolicy::default()
            .with_hop_penalty(1.0)
            .score(Some(&obs(0.2, 5)), None, true);
        assert!(floor.abs() < f64::EPSILON);
    }

    #[test]
    fn test_no_observation_scores_zero() {
        assert!(ConfidencePolicy::default().score(None, None, false).abs() < f64::EPSILON);
    }

    #[test]
    fn test_observation_merge() {
        let mut o = obs(0.5, 3);
        o.merge(0.9, 4, &["x".to_string()]);
        assert!((o.confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(o.hop_count, 3);
        o.merge(0.1, 1, &["a".to_string(), "b".to_string()]);
        assert_eq!(o.hop_count, 1);
        assert_eq!(o.path, vec!["a", "b"]);
    }
}
