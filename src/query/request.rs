//! Logical query request types.
//!
//! A `QueryRequest` is the immutable description of what to fetch. It is
//! produced by `QueryBuilder::build`, after target kinds have been validated
//! against the registry, and is what the cache keys on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A filter on a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Field equals value.
    Eq {
        /// Value to compare against.
        value: Value,
    },
    /// Field differs from value (missing fields count as different).
    Ne {
        /// Value to compare against.
        value: Value,
    },
    /// Field equals one of the values.
    In {
        /// Accepted values.
        values: Vec<Value>,
    },
    /// Inclusive range; either bound may be open.
    Range {
        /// Lower bound, if any.
        min: Option<Value>,
        /// Upper bound, if any.
        max: Option<Value>,
    },
    /// Field is missing or null.
    IsNull,
    /// Field is present and not null.
    NotNull,
}

impl Condition {
    /// Equality condition.
    #[must_use]
    pub fn eq(value: impl Into<Value>) -> Self {
        Self::Eq { value: value.into() }
    }

    /// Inequality condition.
    #[must_use]
    pub fn ne(value: impl Into<Value>) -> Self {
        Self::Ne { value: value.into() }
    }

    /// Membership condition. Values are sorted and deduplicated so logically
    /// equal conditions compare (and serialize) equal.
    #[must_use]
    pub fn one_of<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let mut values: Vec<Value> = values.into_iter().map(Into::into).collect();
        values.sort_by(Value::compare);
        values.dedup_by(|a, b| a.compare(b).is_eq());
        Self::In { values }
    }

    /// Inclusive range; `None` leaves a bound open.
    #[must_use]
    pub fn range(min: Option<Value>, max: Option<Value>) -> Self {
        Self::Range { min, max }
    }

    /// Every operand value the condition compares against.
    pub fn operands(&self) -> impl Iterator<Item = &Value> {
        let values: Vec<&Value> = match self {
            Self::Eq { value } | Self::Ne { value } => vec![value],
            Self::In { values } => values.iter().collect(),
            Self::Range { min, max } => min.iter().chain(max.iter()).collect(),
            Self::IsNull | Self::NotNull => Vec::new(),
        };
        values.into_iter()
    }

    /// Evaluates the condition against a field value (`None` = missing).
    #[must_use]
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let value = value.filter(|v| !v.is_null());
        match self {
            Self::Eq { value: expected } => value.is_some_and(|v| v.compare(expected).is_eq()),
            Self::Ne { value: expected } => value.map_or(true, |v| !v.compare(expected).is_eq()),
            Self::In { values } => value.is_some_and(|v| values.iter().any(|c| v.compare(c).is_eq())),
            Self::Range { min, max } => value.is_some_and(|v| {
                min.as_ref().map_or(true, |m| v.compare(m).is_ge())
                    && max.as_ref().map_or(true, |m| v.compare(m).is_le())
            }),
            Self::IsNull => value.is_none(),
            Self::NotNull => value.is_some(),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// One `ORDER BY` term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    /// Field to sort on.
    pub field: String,
    /// Sort direction.
    pub direction: SortDirection,
}

impl OrderBy {
    /// Ascending on `field`.
    #[must_use]
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    /// Descending on `field`.
    #[must_use]
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Which target kinds the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TargetFilter {
    /// Every registered target (active only unless `include_inactive`).
    All {
        /// Also include targets marked inactive.
        include_inactive: bool,
    },
    /// An explicit set of target kinds.
    Only {
        /// The requested kinds.
        target_kinds: BTreeSet<String>,
    },
}

impl TargetFilter {
    /// True when the filter follows the registry rather than naming kinds.
    #[must_use]
    pub const fn is_all(&self) -> bool {
        matches!(self, Self::All { .. })
    }
}

/// Aggregation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    /// Number of rows, or of non-null values per field.
    Count,
    /// Sum of numeric values.
    Sum,
    /// Mean of numeric values.
    Avg,
    /// Smallest numeric value.
    Min,
    /// Largest numeric value.
    Max,
}

impl AggregateFn {
    /// Lowercase name used in output field names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    /// True for functions that need numeric input.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        !matches!(self, Self::Count)
    }
}

impl fmt::Display for AggregateFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields × functions, optionally grouped by target kind.
///
/// Fields and functions are kept sorted and deduplicated; output records do
/// not depend on the order they were requested in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationSpec {
    fields: Vec<String>,
    functions: Vec<AggregateFn>,
    group_by_target: bool,
}

impl AggregationSpec {
    /// Creates an ungrouped aggregation.
    #[must_use]
    pub fn new<F, S>(functions: impl IntoIterator<Item = AggregateFn>, fields: F) -> Self
    where
        F: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: BTreeSet<String> = fields.into_iter().map(Into::into).collect();
        let functions: BTreeSet<AggregateFn> = functions.into_iter().collect();
        Self {
            fields: fields.into_iter().collect(),
            functions: functions.into_iter().collect(),
            group_by_target: false,
        }
    }

    /// Row count only.
    #[must_use]
    pub fn count() -> Self {
        Self::new([AggregateFn::Count], Vec::<String>::new())
    }

    /// Partition rows by discriminator value before aggregating.
    #[must_use]
    pub fn grouped_by_target(mut self) -> Self {
        self.group_by_target = true;
        self
    }

    /// Aggregated fields, sorted.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Requested functions, sorted.
    #[must_use]
    pub fn functions(&self) -> &[AggregateFn] {
        &self.functions
    }

    /// True if grouped by target kind.
    #[must_use]
    pub const fn group_by_target(&self) -> bool {
        self.group_by_target
    }
}

/// Limit / offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum rows to return.
    pub limit: Option<usize>,
    /// Rows to skip.
    pub offset: usize,
}

/// A validated, immutable query description.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub(crate) association: String,
    pub(crate) filter: TargetFilter,
    pub(crate) target_kinds: Vec<String>,
    pub(crate) conditions: BTreeMap<String, Condition>,
    pub(crate) order_by: Vec<OrderBy>,
    pub(crate) pagination: Pagination,
    pub(crate) with_targets: bool,
    pub(crate) aggregation: Option<AggregationSpec>,
    pub(crate) timeout: Option<Duration>,
}

impl QueryRequest {
    /// Association being queried.
    #[must_use]
    pub fn association(&self) -> &str {
        &self.association
    }

    /// The filter as requested.
    #[must_use]
    pub const fn filter(&self) -> &TargetFilter {
        &self.filter
    }

    /// Target kinds the query is restricted to, resolved and sorted.
    #[must_use]
    pub fn target_kinds(&self) -> &[String] {
        &self.target_kinds
    }

    /// Field conditions, keyed by field.
    #[must_use]
    pub const fn conditions(&self) -> &BTreeMap<String, Condition> {
        &self.conditions
    }

    /// Sort terms.
    #[must_use]
    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    /// Limit and offset.
    #[must_use]
    pub const fn pagination(&self) -> Pagination {
        self.pagination
    }

    /// Whether target records are eager-loaded onto each row.
    #[must_use]
    pub const fn with_targets(&self) -> bool {
        self.with_targets
    }

    /// Aggregation, if any.
    #[must_use]
    pub const fn aggregation(&self) -> Option<&AggregationSpec> {
        self.aggregation.as_ref()
    }

    /// Caller-supplied timeout, if any.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// True if the request covers `target_kind`, either explicitly or by
    /// following the registry's full target set.
    #[must_use]
    pub fn involves_target(&self, target_kind: &str) -> bool {
        self.filter.is_all() || self.target_kinds.iter().any(|t| t == target_kind)
    }

    /// Copy of this request narrowed to one target kind.
    pub(crate) fn narrowed_to(&self, target_kind: &str) -> Self {
        let mut out = self.clone();
        out.filter = TargetFilter::Only {
            target_kinds: BTreeSet::from([target_kind.to_string()]),
        };
        out.target_kinds = vec![target_kind.to_string()];
        out
    }
}
