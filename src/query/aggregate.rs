//! In-process aggregation over fetched rows.
//!
//! Values that cannot be coerced to a number are skipped rather than failing
//! the query; a field with no usable values aggregates to `Null`.

use std::collections::BTreeMap;

use tracing::debug;

use crate::query::request::{AggregateFn, AggregationSpec};
use crate::value::{Record, Value};

/// Output field holding the group's target kind when grouping.
pub const TARGET_KIND_FIELD: &str = "target_kind";

/// Output field holding the row count.
pub const COUNT_FIELD: &str = "count";

/// Aggregates `rows`, one output record per group.
///
/// Ungrouped aggregation always yields exactly one record, even for no rows.
/// Grouped aggregation yields one record per discriminator value observed;
/// rows without a string discriminator are left out.
pub(crate) fn aggregate(rows: &[Record], spec: &AggregationSpec, discriminator_field: &str) -> Vec<Record> {
    if !spec.group_by_target() {
        let all: Vec<&Record> = rows.iter().collect();
        return vec![aggregate_group(&all, spec)];
    }

    let mut groups: BTreeMap<&str, Vec<&Record>> = BTreeMap::new();
    let mut orphans = 0usize;
    for row in rows {
        match row.get_str(discriminator_field) {
            Some(kind) => groups.entry(kind).or_default().push(row),
            None => orphans += 1,
        }
    }
    if orphans > 0 {
        debug!(discriminator_field, orphans, "rows without discriminator left out of grouping");
    }

    groups
        .into_iter()
        .map(|(kind, members)| {
            let mut out = aggregate_group(&members, spec);
            out.insert(TARGET_KIND_FIELD, kind);
            out
        })
        .collect()
}

fn aggregate_group(rows: &[&Record], spec: &AggregationSpec) -> Record {
    let mut out = Record::new();

    for func in spec.functions() {
        if spec.fields().is_empty() {
            // Only `count` is legal without fields; the builder rejects the rest.
            if *func == AggregateFn::Count {
                out.insert(COUNT_FIELD, count_value(rows.len()));
            }
            continue;
        }
        for field in spec.fields() {
            let name = format!("{func}_{field}");
            let value = match func {
                AggregateFn::Count => {
                    let present = rows
                        .iter()
                        .filter(|r| r.get(field).is_some_and(|v| !v.is_null()))
                        .count();
                    count_value(present)
                }
                _ => numeric(*func, field, rows),
            };
            out.insert(name, value);
        }
    }

    out
}

fn count_value(n: usize) -> Value {
    Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

#[allow(clippy::cast_precision_loss)]
fn numeric(func: AggregateFn, field: &str, rows: &[&Record]) -> Value {
    let mut skipped = 0usize;
    let values: Vec<f64> = rows
        .iter()
        .filter_map(|r| r.get(field))
        .filter(|v| !v.is_null())
        .filter_map(|v| {
            let n = v.as_f64();
            if n.is_none() {
                skipped += 1;
            }
            n
        })
        .collect();

    if skipped > 0 {
        debug!(field, skipped, function = %func, "skipped non-numeric values");
    }
    if values.is_empty() {
        return Value::Null;
    }

    let result = match func {
        AggregateFn::Sum => values.iter().sum(),
        AggregateFn::Avg => values.iter().sum::<f64>() / values.len() as f64,
        AggregateFn::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggregateFn::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregateFn::Count => values.len() as f64,
    };
    Value::Float(result)
}
