//! Fluent query construction.
//!
//! The `QueryBuilder` follows the same shape as the other builders in this
//! crate: every setter is infallible and chains, and all validation happens in
//! `build()`. Target kinds are checked against the registry there, so a
//! request for an unregistered kind fails before anything is executed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::association::validate_identifier;
use crate::error::{AssocError, AssocResult, ValidationError};
use crate::query::batch::BatchResult;
use crate::query::executor::Query;
use crate::query::request::{
    AggregationSpec, Condition, OrderBy, Pagination, QueryRequest, SortDirection, TargetFilter,
};
use crate::registry::AssociationRegistry;
use crate::storage::DataSource;
use crate::value::{Record, Value};

/// Builder for polymorphic association queries.
///
/// # Example
/// ```rust,ignore
/// let rows = QueryBuilder::new(registry, source, "commentable")
///     .target("posts")
///     .eq("status", "published")
///     .order_by("created_at", SortDirection::Desc)
///     .limit(20)
///     .with_targets()
///     .execute()?;
/// ```
#[derive(Clone)]
pub struct QueryBuilder {
    registry: Arc<AssociationRegistry>,
    source: Arc<dyn DataSource>,
    association: String,
    targets: Option<BTreeSet<String>>,
    include_inactive: bool,
    conditions: BTreeMap<String, Condition>,
    order_by: Vec<OrderBy>,
    limit: Option<usize>,
    offset: usize,
    with_targets: bool,
    aggregation: Option<AggregationSpec>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for QueryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("association", &self.association)
            .field("targets", &self.targets)
            .field("include_inactive", &self.include_inactive)
            .field("conditions", &self.conditions)
            .field("order_by", &self.order_by)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("with_targets", &self.with_targets)
            .field("aggregation", &self.aggregation)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl QueryBuilder {
    /// Starts a query over `association`.
    pub fn new(
        registry: Arc<AssociationRegistry>,
        source: Arc<dyn DataSource>,
        association: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            source,
            association: association.into(),
            targets: None,
            include_inactive: false,
            conditions: BTreeMap::new(),
            order_by: Vec::new(),
            limit: None,
            offset: 0,
            with_targets: false,
            aggregation: None,
            timeout: None,
        }
    }

    /// Restrict to one target kind (may be called repeatedly).
    #[must_use]
    pub fn target(mut self, target_kind: impl Into<String>) -> Self {
        self.targets.get_or_insert_with(BTreeSet::new).insert(target_kind.into());
        self
    }

    /// Restrict to a set of target kinds.
    #[must_use]
    pub fn targets<I, S>(mut self, target_kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets
            .get_or_insert_with(BTreeSet::new)
            .extend(target_kinds.into_iter().map(Into::into));
        self
    }

    /// Allow inactive target kinds (default: active only).
    #[must_use]
    pub fn include_inactive(mut self) -> Self {
        self.include_inactive = true;
        self
    }

    /// Adds a condition on `field`, replacing any earlier one on that field.
    #[must_use]
    pub fn filter(mut self, field: impl Into<String>, condition: Condition) -> Self {
        self.conditions.insert(field.into(), condition);
        self
    }

    /// Equality condition.
    #[must_use]
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Condition::eq(value))
    }

    /// Inclusive range condition; `None` leaves a bound open.
    #[must_use]
    pub fn range(self, field: impl Into<String>, min: Option<Value>, max: Option<Value>) -> Self {
        self.filter(field, Condition::range(min, max))
    }

    /// Appends an ordering term.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Caps the number of rows.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips the first `offset` rows.
    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Eager-load each row's target record under the `target` field.
    #[must_use]
    pub fn with_targets(mut self) -> Self {
        self.with_targets = true;
        self
    }

    /// Return aggregate records instead of rows.
    #[must_use]
    pub fn aggregate(mut self, spec: AggregationSpec) -> Self {
        self.aggregation = Some(spec);
        self
    }

    /// Fail execution with `Timeout` if the data source takes longer.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validates everything against the registry and produces a `Query`.
    ///
    /// # Errors
    ///
    /// - `UnknownAssociation` if the association is not registered
    /// - `InvalidTarget` if a requested kind is unregistered, or inactive
    ///   without `include_inactive`
    /// - `MalformedAggregation` for an aggregation without functions, or a
    ///   numeric function without fields
    /// - `Validation` for malformed field names
    pub fn build(self) -> AssocResult<Query> {
        let association = self
            .registry
            .association(&self.association)
            .ok_or_else(|| AssocError::unknown_association(&self.association))?;

        for (field, condition) in &self.conditions {
            validate_identifier("condition field", field)?;
            // JSON has no encoding for NaN or infinities; keys would collide.
            if condition
                .operands()
                .any(|v| matches!(v, Value::Float(f) if !f.is_finite()))
            {
                return Err(ValidationError::NonFiniteValue { field: field.clone() }.into());
            }
        }
        for order in &self.order_by {
            validate_identifier("order_by field", &order.field)?;
        }
        if let Some(agg) = &self.aggregation {
            validate_aggregation(agg)?;
        }

        let (filter, target_kinds) = match self.targets {
            Some(requested) if !requested.is_empty() => {
                for kind in &requested {
                    match association.target(kind) {
                        None => {
                            return Err(AssocError::invalid_target(&self.association, kind, "not registered"));
                        }
                        Some(t) if !t.active && !self.include_inactive => {
                            return Err(AssocError::invalid_target(
                                &self.association,
                                kind,
                                "target is inactive; use include_inactive to query it",
                            ));
                        }
                        Some(_) => {}
                    }
                }
                let kinds = requested.iter().cloned().collect();
                (TargetFilter::Only { target_kinds: requested }, kinds)
            }
            _ => (
                TargetFilter::All {
                    include_inactive: self.include_inactive,
                },
                association.target_kinds(self.include_inactive),
            ),
        };

        let request = QueryRequest {
            association: self.association,
            filter,
            target_kinds,
            conditions: self.conditions,
            order_by: self.order_by,
            pagination: Pagination {
                limit: self.limit,
                offset: self.offset,
            },
            with_targets: self.with_targets,
            aggregation: self.aggregation,
            timeout: self.timeout,
        };

        Ok(Query::new(request, association, self.source))
    }

    /// Builds and executes.
    pub fn execute(self) -> AssocResult<Vec<Record>> {
        self.build()?.execute()
    }

    /// Builds and executes one query per target kind concurrently.
    pub fn execute_batch(self) -> AssocResult<BatchResult> {
        Ok(self.build()?.execute_batch())
    }
}

fn validate_aggregation(spec: &AggregationSpec) -> AssocResult<()> {
    if spec.functions().is_empty() {
        return Err(AssocError::MalformedAggregation {
            reason: "no aggregation functions requested".to_string(),
        });
    }
    if spec.fields().is_empty() {
        if let Some(f) = spec.functions().iter().find(|f| f.is_numeric()) {
            return Err(AssocError::MalformedAggregation {
                reason: format!("{f} needs at least one field"),
            });
        }
    }
    for field in spec.fields() {
        validate_identifier("aggregation field", field)?;
    }
    Ok(())
}
