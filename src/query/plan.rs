//! Executable plans and advisory plan analysis.

use serde::{Deserialize, Serialize};

use crate::query::request::{Condition, OrderBy, QueryRequest};
use crate::value::Value;

/// A single-collection fetch handed to the data-access collaborator.
///
/// The plan is deliberately flat (one collection, conjunctive conditions) so
/// any backend can run it without sharing a query language with this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Table to scan.
    pub table: String,
    /// Conjunctive field conditions.
    pub conditions: Vec<(String, Condition)>,
    /// Sort terms, applied in order.
    pub order_by: Vec<OrderBy>,
    /// Maximum rows to return.
    pub limit: Option<usize>,
    /// Rows to skip.
    pub offset: usize,
}

impl QueryPlan {
    /// Unfiltered scan of `table`.
    #[must_use]
    pub fn scan(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            conditions: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    /// Adds a condition on `field`.
    #[must_use]
    pub fn filter(mut self, field: impl Into<String>, condition: Condition) -> Self {
        self.conditions.push((field.into(), condition));
        self
    }

    /// Appends a sort term.
    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Sets the row cap.
    #[must_use]
    pub const fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the number of rows to skip.
    #[must_use]
    pub const fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Plan for the owning records of a request.
    pub(crate) fn for_request(request: &QueryRequest, table: &str, discriminator_field: &str) -> Self {
        let mut plan = Self::scan(table).filter(
            discriminator_field,
            Condition::one_of(request.target_kinds().iter().map(|k| Value::from(k.as_str()))),
        );
        for (field, condition) in request.conditions() {
            plan = plan.filter(field.clone(), condition.clone());
        }
        for order in request.order_by() {
            plan = plan.order_by(order.clone());
        }
        plan.limit(request.pagination().limit)
            .offset(request.pagination().offset)
    }
}

/// Relative cost multiplier for eager-loading target records.
const JOIN_COST: f64 = 2.5;

/// Per function × field cost added by aggregation.
const AGGREGATION_STEP_COST: f64 = 0.25;

/// Valid-target count above which unrestricted queries get a hint.
const MANY_TARGETS_THRESHOLD: usize = 5;

/// Advisory cost estimate and optimisation hints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnalysis {
    /// Relative cost: targets × join cost × aggregation cost.
    pub estimated_cost: f64,
    /// Target kinds the query covers.
    pub target_count: usize,
    /// Cost of eager-loading target records.
    pub join_cost: f64,
    /// Cost of aggregation.
    pub aggregation_cost: f64,
    /// Suggestions for cheaper variants.
    pub hints: Vec<String>,
}

impl QueryAnalysis {
    /// Analyses a request. `valid_targets` is the association's current
    /// valid-target count.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn of(request: &QueryRequest, valid_targets: usize) -> Self {
        let target_count = request.target_kinds().len();
        let join_cost = if request.with_targets() { JOIN_COST } else { 1.0 };
        let aggregation_cost = request.aggregation().map_or(1.0, |agg| {
            let steps = agg.functions().len() * agg.fields().len().max(1);
            let base = 1.0 + AGGREGATION_STEP_COST * steps as f64;
            if agg.group_by_target() {
                base * 1.2
            } else {
                base
            }
        });
        let estimated_cost = target_count.max(1) as f64 * join_cost * aggregation_cost;

        let mut hints = Vec::new();
        if request.filter().is_all() && valid_targets > MANY_TARGETS_THRESHOLD {
            hints.push(format!(
                "restrict target kinds: association '{}' has {valid_targets} valid targets",
                request.association()
            ));
        }
        if request.with_targets() && request.pagination().limit.is_none() {
            hints.push("add a limit: eager loading without pagination fetches every target record".to_string());
        }
        if request.conditions().is_empty() && request.pagination().limit.is_none() && request.aggregation().is_none() {
            hints.push("unbounded scan: add conditions or a limit".to_string());
        }
        if request.pagination().offset > 0 && request.order_by().is_empty() {
            hints.push("offset without ordering returns unstable pages: add order_by".to_string());
        }
        if let Some(agg) = request.aggregation() {
            if agg.group_by_target() && target_count == 1 {
                hints.push("grouping by target kind is redundant for a single target".to_string());
            }
        }

        Self {
            estimated_cost,
            target_count,
            join_cost,
            aggregation_cost,
            hints,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::query::request::{AggregateFn, AggregationSpec, Pagination, TargetFilter};

    fn request(filter: TargetFilter, kinds: &[&str]) -> QueryRequest {
        QueryRequest {
            association: "commentable".to_string(),
            filter,
            target_kinds: kinds.iter().map(|k| (*k).to_string()).collect(),
            conditions: BTreeMap::new(),
            order_by: Vec::new(),
            pagination: Pagination::default(),
            with_targets: false,
            aggregation: None,
            timeout: None,
        }
    }

    #[test]
    fn test_plan_for_request_filters_discriminator() {
        let mut req = request(TargetFilter::All { include_inactive: false }, &["posts", "videos"]);
        req.conditions.insert("status".to_string(), Condition::eq("open"));
        req.pagination = Pagination { limit: Some(10), offset: 5 };

        let plan = QueryPlan::for_request(&req, "comments", "commentable_type");
        assert_eq!(plan.table, "comments");
        assert_eq!(plan.conditions[0].0, "commentable_type");
        assert_eq!(plan.conditions[0].1, Condition::one_of(["posts", "videos"]));
        assert_eq!(plan.conditions[1], ("status".to_string(), Condition::eq("open")));
        assert_eq!(plan.limit, Some(10));
        assert_eq!(plan.offset, 5);
    }

    #[test]
    fn test_analysis_hints_many_targets() {
        let kinds = ["a", "b", "c", "d", "e", "f"];
        let req = request(TargetFilter::All { include_inactive: false }, &kinds);
        let analysis = QueryAnalysis::of(&req, kinds.len());
        assert_eq!(analysis.target_count, 6);
        assert!(analysis.hints.iter().any(|h| h.starts_with("restrict target kinds")));
        assert!(analysis.hints.iter().any(|h| h.starts_with("unbounded scan")));
    }

    #[test]
    fn test_analysis_no_restrict_hint_for_explicit_targets() {
        let req = request(
            TargetFilter::Only {
                target_kinds: BTreeSet::from(["a".to_string()]),
            },
            &["a"],
        );
        let analysis = QueryAnalysis::of(&req, 9);
        assert!(!analysis.hints.iter().any(|h| h.starts_with("restrict target kinds")));
    }

    #[test]
    fn test_analysis_cost_grows_with_joins_and_aggregation() {
        let plain = request(TargetFilter::All { include_inactive: false }, &["a", "b"]);
        let mut heavy = plain.clone();
        heavy.with_targets = true;
        heavy.aggregation = Some(AggregationSpec::new([AggregateFn::Sum, AggregateFn::Avg], ["amount"]).grouped_by_target());

        let base = QueryAnalysis::of(&plain, 2);
        let costly = QueryAnalysis::of(&heavy, 2);
        assert!((base.estimated_cost - 2.0).abs() < f64::EPSILON);
        assert!(costly.estimated_cost > base.estimated_cost);
        assert!(costly.hints.iter().any(|h| h.starts_with("add a limit")));
    }
}
