//! Scheduled discovery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::discovery::{ApplyReport, DiscoveryEngine, DiscoveryResult};
use crate::error::{AssocResult, DiscoveryError, ExecutionError};
use crate::periodic::Periodic;

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryRun {
    /// Everything found, most confident first.
    pub results: Vec<DiscoveryResult>,
    /// Candidates that could not be analysed.
    pub errors: Vec<DiscoveryError>,
    /// What was written to the registry.
    pub applied: ApplyReport,
}

/// Scheduled discovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryWorkerConfig {
    /// Time between passes.
    pub interval: Duration,
    /// Apply field-analysis results that reach the auto-apply confidence.
    pub auto_apply: bool,
    /// Relationship names fed to naming-pattern discovery on every pass.
    pub known_relationships: Vec<String>,
}

impl Default for DiscoveryWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            auto_apply: false,
            known_relationships: Vec::new(),
        }
    }
}

impl DiscoveryWorkerConfig {
    /// Sets the time between passes.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Enables or disables auto-apply.
    #[must_use]
    pub const fn with_auto_apply(mut self, auto_apply: bool) -> Self {
        self.auto_apply = auto_apply;
        self
    }

    /// Sets the relationship names used for naming discovery.
    #[must_use]
    pub fn with_known_relationships<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_relationships = names.into_iter().map(Into::into).collect();
        self
    }
}

struct WorkerState {
    engine: DiscoveryEngine,
    config: DiscoveryWorkerConfig,
    last_run: Mutex<Option<DiscoveryRun>>,
    runs: AtomicU64,
}

impl WorkerState {
    fn run(&self) -> DiscoveryRun {
        let run = self
            .engine
            .run_once(&self.config.known_relationships, self.config.auto_apply);
        let n = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            run = n,
            found = run.results.len(),
            applied = run.applied.applied.len(),
            errors = run.errors.len(),
            "discovery pass complete"
        );
        *self.last_run.lock().unwrap_or_else(PoisonError::into_inner) = Some(run.clone());
        run
    }
}

/// Runs `DiscoveryEngine::run_once` on a background thread at a fixed
/// interval. Stops on `stop()` or drop.
pub struct DiscoveryWorker {
    state: Arc<WorkerState>,
    ticker: Periodic,
}

impl std::fmt::Debug for DiscoveryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryWorker")
            .field("config", &self.state.config)
            .field("runs", &self.runs())
            .field("ticker", &self.ticker)
            .finish()
    }
}

impl DiscoveryWorker {
    /// Starts the worker. The first pass runs one interval after spawning.
    ///
    /// # Errors
    ///
    /// `WorkerFailed` if the thread cannot be spawned.
    pub fn spawn(engine: DiscoveryEngine, config: DiscoveryWorkerConfig) -> AssocResult<Self> {
        let interval = config.interval;
        let state = Arc::new(WorkerState {
            engine,
            config,
            last_run: Mutex::new(None),
            runs: AtomicU64::new(0),
        });
        let ticker = Periodic::spawn("kyro-assoc-discovery", Arc::downgrade(&state), interval, |state| {
            state.run();
        })
        .map_err(|e| ExecutionError::WorkerFailed {
            reason: format!("failed to spawn discovery worker: {e}"),
        })?;
        Ok(Self { state, ticker })
    }

    /// Runs a pass on the calling thread, outside the schedule.
    pub fn run_now(&self) -> DiscoveryRun {
        self.state.run()
    }

    /// Completed passes, scheduled or not.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.state.runs.load(Ordering::Relaxed)
    }

    /// Outcome of the most recent pass.
    #[must_use]
    pub fn last_run(&self) -> Option<DiscoveryRun> {
        self.state
            .last_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The engine the worker drives.
    #[must_use]
    pub fn engine(&self) -> &DiscoveryEngine {
        &self.state.engine
    }

    /// Stops the schedule and waits for an in-flight pass to finish.
    pub fn stop(&mut self) {
        self.ticker.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::association::{AssociationSpec, Provenance};
    use crate::registry::AssociationRegistry;
    use crate::storage::InMemoryDataSource;
    use crate::value::Record;

    fn engine() -> (Arc<AssociationRegistry>, DiscoveryEngine) {
        let registry = Arc::new(AssociationRegistry::new());
        registry
            .register_association(AssociationSpec::new("loggable").table("audit_logs"))
            .unwrap();
        let source = Arc::new(InMemoryDataSource::new());
        for (i, kind) in ["Job", "Task", "Job"].iter().enumerate() {
            let id = i64::try_from(i).unwrap();
            source
                .insert(
                    "audit_logs",
                    Record::new().with("id", id).with("loggable_type", *kind).with("loggable_id", id),
                )
                .unwrap();
        }
        let engine = DiscoveryEngine::new(Arc::clone(&registry), source);
        (registry, engine)
    }

    #[test]
    fn test_scheduled_runs_apply_when_enabled() {
        let (registry, engine) = engine();
        let config = DiscoveryWorkerConfig::default()
            .with_interval(Duration::from_millis(10))
            .with_auto_apply(true);
        let mut worker = DiscoveryWorker::spawn(engine, config).unwrap();

        for _ in 0..200 {
            if worker.runs() > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        worker.stop();

        assert!(worker.runs() >= 1);
        assert!(worker.last_run().is_some());
        assert_eq!(registry.get_valid_targets("loggable", false).unwrap(), vec!["Job", "Task"]);
    }

    #[test]
    fn test_run_now_without_auto_apply_leaves_pending() {
        let (registry, engine) = engine();
        let config = DiscoveryWorkerConfig::default()
            .with_interval(Duration::from_secs(3600))
            .with_known_relationships(["loggableInvoice"]);
        let worker = DiscoveryWorker::spawn(engine, config).unwrap();

        let run = worker.run_now();
        assert_eq!(worker.runs(), 1);
        // Naming matches are pre-validated; field-analysis ones wait.
        assert_eq!(run.applied.applied.len(), 1);
        assert_eq!(run.applied.applied[0].provenance, Provenance::Generated);
        assert_eq!(run.applied.pending.len(), 2);
        assert_eq!(registry.get_valid_targets("loggable", false).unwrap(), vec!["Invoice"]);
    }
}
