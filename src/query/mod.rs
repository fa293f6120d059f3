//! Query construction and execution.
//!
//! - `request`: the immutable `QueryRequest` and its parts
//! - `builder`: fluent `QueryBuilder`, validating against the registry
//! - `plan`: flat `QueryPlan`s for the data source, and `QueryAnalysis`
//! - `executor`: `Query` execution, eager loading, timeouts
//! - `aggregate`: in-process aggregation
//! - `batch`: per-target-kind concurrent execution

mod aggregate;
mod batch;
mod builder;
mod executor;
mod plan;
mod request;

pub use aggregate::{COUNT_FIELD, TARGET_KIND_FIELD};
pub use batch::{BatchEntry, BatchResult};
pub use builder::QueryBuilder;
pub use executor::{Query, TARGET_FIELD, TARGET_KEY_FIELD};
pub use plan::{QueryAnalysis, QueryPlan};
pub use request::{
    AggregateFn, AggregationSpec, Condition, OrderBy, Pagination, QueryRequest, SortDirection, TargetFilter,
};
