//! Per-target-kind fan-out.
//!
//! A batch runs one narrowed query per target kind on scoped threads and
//! collects each outcome separately, so one slow or failing kind neither
//! blocks nor cancels the others.

use std::collections::BTreeMap;

use tracing::warn;

use crate::error::{AssocError, AssocResult, ExecutionError};
use crate::query::executor::Query;
use crate::value::Record;

/// Rows fetched for one target kind.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    /// Rows returned for the target kind.
    pub rows: Vec<Record>,
    /// Number of rows.
    pub count: usize,
}

/// Outcome of `Query::execute_batch`, keyed by target kind.
#[derive(Debug, Default)]
pub struct BatchResult {
    results: BTreeMap<String, AssocResult<BatchEntry>>,
}

impl BatchResult {
    /// Outcome for one target kind.
    #[must_use]
    pub fn get(&self, target_kind: &str) -> Option<&AssocResult<BatchEntry>> {
        self.results.get(target_kind)
    }

    /// Successful kinds, in target-kind order.
    pub fn succeeded(&self) -> impl Iterator<Item = (&str, &BatchEntry)> {
        self.results
            .iter()
            .filter_map(|(k, r)| r.as_ref().ok().map(|e| (k.as_str(), e)))
    }

    /// Failed kinds with their errors.
    pub fn failed(&self) -> impl Iterator<Item = (&str, &AssocError)> {
        self.results
            .iter()
            .filter_map(|(k, r)| r.as_ref().err().map(|e| (k.as_str(), e)))
    }

    /// Target kinds covered by the batch.
    pub fn target_kinds(&self) -> impl Iterator<Item = &str> {
        self.results.keys().map(String::as_str)
    }

    /// Number of target kinds queried.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// True if no target kind was queried.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Total rows over all successful kinds.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.succeeded().map(|(_, e)| e.count).sum()
    }

    /// Per-target results by target kind.
    #[must_use]
    pub fn into_results(self) -> BTreeMap<String, AssocResult<BatchEntry>> {
        self.results
    }
}

pub(crate) fn run(query: &Query) -> BatchResult {
    let kinds = query.request().target_kinds();

    let results: BTreeMap<String, AssocResult<BatchEntry>> = std::thread::scope(|scope| {
        let handles: Vec<_> = kinds
            .iter()
            .map(|kind| {
                let narrowed = query.narrowed_to(kind);
                (kind.clone(), scope.spawn(move || narrowed.execute()))
            })
            .collect();

        handles
            .into_iter()
            .map(|(kind, handle)| {
                let outcome = handle.join().unwrap_or_else(|_| {
                    Err(ExecutionError::WorkerFailed {
                        reason: format!("batch worker for '{kind}' panicked"),
                    }
                    .into())
                });
                let outcome = outcome.map(|rows| BatchEntry { count: rows.len(), rows });
                if let Err(e) = &outcome {
                    warn!(target_kind = %kind, error = %e, "batch query failed for target kind");
                }
                (kind, outcome)
            })
            .collect()
    });

    BatchResult { results }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::association::{AssociationSpec, Provenance};
    use crate::query::builder::QueryBuilder;
    use crate::registry::AssociationRegistry;
    use crate::storage::InMemoryDataSource;
    use crate::value::Record;

    #[test]
    fn test_batch_splits_by_kind() {
        let registry = Arc::new(AssociationRegistry::new());
        registry
            .register_association(AssociationSpec::new("loggable").table("logs"))
            .unwrap();
        registry.add_target("loggable", "jobs", "Job", Provenance::Manual).unwrap();
        registry.add_target("loggable", "tasks", "Task", Provenance::Manual).unwrap();

        let source = Arc::new(InMemoryDataSource::new());
        for (id, kind) in [(1, "jobs"), (2, "tasks"), (3, "jobs")] {
            source
                .insert("logs", Record::new().with("id", id).with("loggable_type", kind))
                .unwrap();
        }

        let batch = QueryBuilder::new(registry, source.clone(), "loggable")
            .execute_batch()
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.get("jobs").unwrap().as_ref().unwrap().count, 2);
        assert_eq!(batch.get("tasks").unwrap().as_ref().unwrap().count, 1);
        assert_eq!(batch.total_count(), 3);
        assert_eq!(batch.failed().count(), 0);
        assert_eq!(source.query_count(), 2);
    }

    #[test]
    fn test_batch_failure_is_per_kind() {
        let registry = Arc::new(AssociationRegistry::new());
        registry
            .register_association(AssociationSpec::new("loggable").table("logs"))
            .unwrap();
        registry.add_target("loggable", "jobs", "Job", Provenance::Manual).unwrap();
        registry.add_target("loggable", "tasks", "Task", Provenance::Manual).unwrap();

        let source = Arc::new(InMemoryDataSource::new());
        source
            .insert("logs", Record::new().with("id", 1).with("loggable_type", "jobs").with("loggable_id", 7))
            .unwrap();
        source.insert("jobs", Record::new().with("id", 7)).unwrap();
        source
            .insert("logs", Record::new().with("id", 2).with("loggable_type", "tasks").with("loggable_id", 8))
            .unwrap();

        // Eager loading fails for tasks: there is no tasks table.
        let batch = QueryBuilder::new(registry, source, "loggable")
            .with_targets()
            .execute_batch()
            .unwrap();
        assert_eq!(batch.succeeded().map(|(k, _)| k).collect::<Vec<_>>(), vec!["jobs"]);
        let failed: Vec<_> = batch.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "tasks");
        assert!(failed[0].1.is_execution());
    }
}
