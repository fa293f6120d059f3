//! Query execution against the data-access collaborator.
//!
//! Execution of one `Query` is:
//! 1. fetch the owning rows with a single plan filtered by discriminator;
//! 2. optionally eager-load target records, one `id In (...)` plan per
//!    target kind that appears in the rows;
//! 3. optionally aggregate in-process.
//!
//! With a timeout, the whole fetch runs on a worker thread and the caller
//! waits on a bounded channel. A timed-out fetch is abandoned: its result is
//! dropped when it eventually completes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::debug;

use crate::association::Association;
use crate::error::{AssocResult, ExecutionError};
use crate::query::aggregate::aggregate;
use crate::query::batch::{self, BatchResult};
use crate::query::plan::{QueryAnalysis, QueryPlan};
use crate::query::request::{Condition, QueryRequest};
use crate::storage::DataSource;
use crate::value::{Record, Value};

/// Field under which eager-loaded target records are attached.
pub const TARGET_FIELD: &str = "target";

/// Key field of target records.
pub const TARGET_KEY_FIELD: &str = "id";

/// A validated query, ready to run.
///
/// Holds a snapshot of the association taken at build time, so a registry
/// change after `build()` does not alter what this query fetches.
#[derive(Clone)]
pub struct Query {
    request: QueryRequest,
    association: Association,
    source: Arc<dyn DataSource>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("request", &self.request)
            .field("association", &self.association.name())
            .finish_non_exhaustive()
    }
}

impl Query {
    pub(crate) fn new(request: QueryRequest, association: Association, source: Arc<dyn DataSource>) -> Self {
        Self {
            request,
            association,
            source,
        }
    }

    /// The validated request.
    #[must_use]
    pub const fn request(&self) -> &QueryRequest {
        &self.request
    }

    /// Association snapshot the query was built against.
    #[must_use]
    pub const fn association(&self) -> &Association {
        &self.association
    }

    /// The plan used to fetch the owning rows.
    #[must_use]
    pub fn plan(&self) -> QueryPlan {
        QueryPlan::for_request(
            &self.request,
            self.association.table(),
            self.association.discriminator_field(),
        )
    }

    /// Advisory cost estimate and hints.
    #[must_use]
    pub fn analyze(&self) -> QueryAnalysis {
        QueryAnalysis::of(&self.request, self.association.target_kinds(false).len())
    }

    /// Runs the query.
    ///
    /// # Errors
    ///
    /// - `Execution(Timeout)` if a timeout is set and exceeded
    /// - `Execution(Storage)` if the data source fails
    pub fn execute(&self) -> AssocResult<Vec<Record>> {
        let started = Instant::now();
        let rows = match self.request.timeout() {
            Some(timeout) => self.fetch_with_timeout(timeout)?,
            None => fetch(self.source.as_ref(), &self.request, &self.association)?,
        };
        debug!(
            association = %self.request.association(),
            targets = self.request.target_kinds().len(),
            rows = rows.len(),
            elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            "query executed"
        );
        Ok(rows)
    }

    /// Runs one query per target kind concurrently.
    ///
    /// Failures are captured per kind and never cancel the other kinds.
    #[must_use]
    pub fn execute_batch(&self) -> BatchResult {
        batch::run(self)
    }

    /// Copy of this query restricted to one target kind.
    pub(crate) fn narrowed_to(&self, target_kind: &str) -> Self {
        Self {
            request: self.request.narrowed_to(target_kind),
            association: self.association.clone(),
            source: Arc::clone(&self.source),
        }
    }

    fn fetch_with_timeout(&self, timeout: Duration) -> AssocResult<Vec<Record>> {
        let (tx, rx) = bounded(1);
        let source = Arc::clone(&self.source);
        let request = self.request.clone();
        let association = self.association.clone();

        std::thread::Builder::new()
            .name("kyro-assoc-query".to_string())
            .spawn(move || {
                // The receiver is gone after a timeout; nothing to report to.
                let _ = tx.send(fetch(source.as_ref(), &request, &association));
            })
            .map_err(|e| ExecutionError::WorkerFailed { reason: e.to_string() })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .into()),
            Err(RecvTimeoutError::Disconnected) => Err(ExecutionError::WorkerFailed {
                reason: "query worker exited without a result".to_string(),
            }
            .into()),
        }
    }
}

fn fetch(source: &dyn DataSource, request: &QueryRequest, association: &Association) -> AssocResult<Vec<Record>> {
    if request.target_kinds().is_empty() {
        // No valid targets means nothing can match the discriminator filter.
        return Ok(match request.aggregation() {
            Some(spec) => aggregate(&[], spec, association.discriminator_field()),
            None => Vec::new(),
        });
    }

    let plan = QueryPlan::for_request(request, association.table(), association.discriminator_field());
    let mut rows = source.run_query(&plan).map_err(ExecutionError::from)?;

    if let Some(spec) = request.aggregation() {
        return Ok(aggregate(&rows, spec, association.discriminator_field()));
    }
    if request.with_targets() {
        attach_targets(source, association, &mut rows)?;
    }
    Ok(rows)
}

/// Loads target records for `rows` and attaches them under `target`.
///
/// Rows whose target cannot be found get `target: null`.
fn attach_targets(source: &dyn DataSource, association: &Association, rows: &mut [Record]) -> AssocResult<()> {
    let discriminator = association.discriminator_field();
    let id_field = association.id_field();

    let mut wanted: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for row in rows.iter() {
        if let (Some(kind), Some(id)) = (row.get_str(discriminator), row.get(id_field)) {
            if !id.is_null() {
                wanted.entry(kind.to_string()).or_default().push(id.clone());
            }
        }
    }

    // (kind, canonical id) -> target record
    let mut loaded: HashMap<(String, String), Record> = HashMap::new();
    for (kind, ids) in wanted {
        let plan = QueryPlan::scan(kind.as_str()).filter(TARGET_KEY_FIELD, Condition::one_of(ids));
        let targets = source.run_query(&plan).map_err(ExecutionError::from)?;
        for target in targets {
            if let Some(key) = target.get(TARGET_KEY_FIELD).map(id_key) {
                loaded.insert((kind.clone(), key), target);
            }
        }
    }

    for row in rows.iter_mut() {
        let found = match (row.get_str(discriminator), row.get(id_field)) {
            (Some(kind), Some(id)) => loaded.get(&(kind.to_string(), id_key(id))),
            _ => None,
        };
        let value = found.map_or(Value::Null, |t| Value::Structured(t.to_json()));
        row.insert(TARGET_FIELD, value);
    }
    Ok(())
}

/// Join key for an id value. Integral floats and ints join with each other.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn id_key(id: &Value) -> String {
    match id {
        Value::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => (*f as i64).to_string(),
        other => other.to_string(),
    }
}
