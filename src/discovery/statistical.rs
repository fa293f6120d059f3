//! Statistical field analysis.
//!
//! A field looks polymorphic when its name reads like a type column, its
//! values look like type names, it has a handful of distinct values, and no
//! single value dominates. Each indicator contributes a weighted share of
//! the confidence score.
//!
//! The weights are heuristic. They are configuration, not contract; tune
//! them against real data.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Multiplier applied when the distinct-value count is outside the
/// reasonable-variety range.
const HIGH_CARDINALITY_PENALTY: f64 = 0.5;

/// Field-name suffixes that mark a discriminator, longest first.
const TYPE_SUFFIXES: &[&str] = &[
    "_category", "Category", "_class", "Class", "_type", "Type", "_kind", "Kind",
];

fn type_field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|_)(?:type|kind|category|class)$|[a-z0-9](?:Type|Kind|Category|Class)$")
            .expect("type field regex is valid")
    })
}

fn type_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z][A-Za-z0-9]*$").expect("type name regex is valid"))
}

/// Indicator weights. They need not sum to 1; the score is capped at 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    /// Weight of a type-like field name.
    pub field_name: f64,
    /// Weight of type-name casing in the values.
    pub casing: f64,
    /// Weight of a reasonable number of distinct values.
    pub variety: f64,
    /// Weight of no single value dominating.
    pub balance: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            field_name: 0.4,
            casing: 0.3,
            variety: 0.2,
            balance: 0.1,
        }
    }
}

/// Statistical discovery configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticalConfig {
    /// Candidates scoring below this are discarded.
    pub min_confidence: f64,
    /// Reasonable variety: inclusive bounds on distinct values.
    pub min_variety: usize,
    /// Upper bound on distinct values.
    pub max_variety: usize,
    /// Largest share of records one value may hold and still count as balanced.
    pub dominance_ceiling: f64,
    /// Indicator weights.
    pub weights: ConfidenceWeights,
}

impl Default for StatisticalConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            min_variety: 2,
            max_variety: 20,
            dominance_ceiling: 0.8,
            weights: ConfidenceWeights::default(),
        }
    }
}

/// Per-indicator scores in [0, 1], before weighting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Indicators {
    /// 1.0 if the field name reads like a type column.
    pub field_name: f64,
    /// Share of distinct values cased like type names.
    pub casing: f64,
    /// 1.0 if the distinct count is in range.
    pub variety: f64,
    /// 1.0 if no value exceeds the dominance ceiling.
    pub balance: f64,
}

/// Distribution and score of one (table, field) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldAnalysis {
    /// Analysed table.
    pub table: String,
    /// Analysed field.
    pub field: String,
    /// Records with a non-null value.
    pub total_records: u64,
    /// Distinct non-null values with their record counts, most frequent first.
    pub values: Vec<(Value, u64)>,
    /// Unweighted indicator scores.
    pub indicators: Indicators,
    /// Weighted score in [0, 1].
    pub confidence: f64,
}

impl FieldAnalysis {
    /// Number of distinct non-null values.
    #[must_use]
    pub fn distinct_count(&self) -> usize {
        self.values.len()
    }

    /// Share of records holding the most frequent value.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn top_share(&self) -> f64 {
        match (self.values.iter().map(|(_, n)| *n).max(), self.total_records) {
            (Some(top), total) if total > 0 => top as f64 / total as f64,
            _ => 0.0,
        }
    }
}

/// True if the field name reads like a discriminator column.
#[must_use]
pub fn is_type_like_field(field: &str) -> bool {
    type_field_regex().is_match(field)
}

/// Scores a field from its distinct-value distribution.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn analyze_field(table: &str, field: &str, mut values: Vec<(Value, u64)>, config: &StatisticalConfig) -> FieldAnalysis {
    values.retain(|(v, n)| !v.is_null() && *n > 0);
    values.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.compare(&b.0)));

    let total_records: u64 = values.iter().map(|(_, n)| *n).sum();
    let distinct = values.len();
    let in_range = (config.min_variety..=config.max_variety).contains(&distinct);

    let casing = if distinct == 0 {
        0.0
    } else {
        let type_named = values
            .iter()
            .filter(|(v, _)| v.as_str().is_some_and(|s| type_name_regex().is_match(s)))
            .count();
        type_named as f64 / distinct as f64
    };

    let mut analysis = FieldAnalysis {
        table: table.to_string(),
        field: field.to_string(),
        total_records,
        values,
        indicators: Indicators {
            field_name: if is_type_like_field(field) { 1.0 } else { 0.0 },
            casing,
            variety: if in_range { 1.0 } else { 0.0 },
            balance: 0.0,
        },
        confidence: 0.0,
    };
    if total_records > 0 && analysis.top_share() <= config.dominance_ceiling {
        analysis.indicators.balance = 1.0;
    }

    let w = &config.weights;
    let i = &analysis.indicators;
    let mut score = w.field_name * i.field_name + w.casing * i.casing + w.variety * i.variety + w.balance * i.balance;
    if !in_range {
        score *= HIGH_CARDINALITY_PENALTY;
    }
    analysis.confidence = score.clamp(0.0, 1.0);
    analysis
}

/// Association-name prefix of a discriminator field (`commentable_type` →
/// `commentable`). `None` if the field has no recognised suffix.
#[must_use]
pub fn field_prefix(field: &str) -> Option<&str> {
    TYPE_SUFFIXES
        .iter()
        .find_map(|suffix| field.strip_suffix(suffix))
        .filter(|prefix| !prefix.is_empty())
}

/// Finds the foreign-id field paired with `discriminator_field`.
///
/// Tried in order: `<prefix>_id`, `<prefix>Id`, `target_id`, `entity_id`,
/// then any other field ending in "id" (case-insensitive) except a bare `id`.
#[must_use]
pub fn infer_id_field(discriminator_field: &str, fields: &[String]) -> Option<String> {
    let has = |name: &str| fields.iter().any(|f| f == name);

    if let Some(prefix) = field_prefix(discriminator_field) {
        for candidate in [format!("{prefix}_id"), format!("{prefix}Id")] {
            if has(&candidate) {
                return Some(candidate);
            }
        }
    }
    for candidate in ["target_id", "entity_id"] {
        if has(candidate) {
            return Some(candidate.to_string());
        }
    }
    fields
        .iter()
        .filter(|f| f.as_str() != discriminator_field && !f.eq_ignore_ascii_case("id"))
        .find(|f| f.to_ascii_lowercase().ends_with("id"))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dist(values: &[(&str, u64)]) -> Vec<(Value, u64)> {
        values.iter().map(|(v, n)| (Value::from(*v), *n)).collect()
    }

    #[test]
    fn test_two_capitalized_values_qualify_for_auto_apply() {
        let a = analyze_field(
            "comments",
            "commentable_type",
            dist(&[("Post", 60), ("Video", 40)]),
            &StatisticalConfig::default(),
        );
        assert!(a.confidence >= 0.7, "confidence {}", a.confidence);
        assert_eq!(a.total_records, 100);
        assert_eq!(a.distinct_count(), 2);
    }

    #[test]
    fn test_fifty_values_score_low() {
        let values: Vec<(Value, u64)> = (0..50).map(|i| (Value::from(format!("Kind{i}")), 3)).collect();
        let a = analyze_field("events", "event_type", values, &StatisticalConfig::default());
        assert!(a.confidence < 0.5, "confidence {}", a.confidence);
        assert!(a.indicators.variety.abs() < f64::EPSILON);
    }

    #[test]
    fn test_dominant_value_loses_balance() {
        let a = analyze_field(
            "comments",
            "commentable_type",
            dist(&[("Post", 95), ("Video", 5)]),
            &StatisticalConfig::default(),
        );
        assert!(a.indicators.balance.abs() < f64::EPSILON);
        assert!((a.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_nulls_are_ignored() {
        let mut values = dist(&[("Post", 2)]);
        values.push((Value::Null, 10));
        let a = analyze_field("t", "kind", values, &StatisticalConfig::default());
        assert_eq!(a.total_records, 2);
        assert_eq!(a.distinct_count(), 1);
    }

    #[test]
    fn test_type_like_field_names() {
        for name in ["type", "commentable_type", "commentableType", "item_kind", "category", "ownerClass"] {
            assert!(is_type_like_field(name), "{name}");
        }
        for name in ["title", "typed_at", "kindness", "id"] {
            assert!(!is_type_like_field(name), "{name}");
        }
    }

    #[test]
    fn test_field_prefix() {
        assert_eq!(field_prefix("commentable_type"), Some("commentable"));
        assert_eq!(field_prefix("ownerKind"), Some("owner"));
        assert_eq!(field_prefix("type"), None);
        assert_eq!(field_prefix("status"), None);
    }

    #[test]
    fn test_infer_id_field_order() {
        let fields: Vec<String> = ["id", "commentable_type", "commentable_id", "target_id"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        assert_eq!(infer_id_field("commentable_type", &fields).as_deref(), Some("commentable_id"));

        let fields: Vec<String> = ["id", "ownerType", "ownerId"].iter().map(|s| (*s).to_string()).collect();
        assert_eq!(infer_id_field("ownerType", &fields).as_deref(), Some("ownerId"));

        let fields: Vec<String> = ["id", "kind", "entity_id"].iter().map(|s| (*s).to_string()).collect();
        assert_eq!(infer_id_field("kind", &fields).as_deref(), Some("entity_id"));

        let fields: Vec<String> = ["id", "kind", "subject_uid"].iter().map(|s| (*s).to_string()).collect();
        assert_eq!(infer_id_field("kind", &fields).as_deref(), Some("subject_uid"));

        let fields: Vec<String> = ["id", "kind", "title"].iter().map(|s| (*s).to_string()).collect();
        assert_eq!(infer_id_field("kind", &fields), None);
    }
}
