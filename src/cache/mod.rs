//! Query result cache.
//!
//! Entries move through **absent → pending → present → expired/evicted**.
//! `pending` is tracked outside the entry map: concurrent misses on one key
//! wait for the in-flight fetch instead of issuing their own, and an entry
//! only ever appears fully populated.
//!
//! The cache is an optimization. Lock poisoning or an unencodable request
//! never surfaces as an error: the cache drops its state or is bypassed and
//! the query runs directly.
//!
//! # Invalidation
//!
//! `QueryCache::attach` subscribes the cache to a registry. Each
//! `RegistryChanged` event invalidates the entries of the changed
//! association that involve the changed target kind.

mod config;
mod entry;
mod filter;
mod key;
mod metrics;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{AssocError, AssocResult, ExecutionError};
use crate::events::{CacheInvalidated, ChangeListener, InvalidationReason, ListenerId, RegistryChanged};
use crate::periodic::Periodic;
use crate::query::{Query, QueryRequest};
use crate::registry::AssociationRegistry;
use crate::time::{to_chrono, Clock, SystemClock};
use crate::value::Record;

pub use config::CacheConfig;
pub use entry::EntryInfo;
pub use filter::InvalidationFilter;
pub use key::CacheKey;
pub use metrics::CacheMetrics;

use entry::CacheEntry;
use metrics::Counters;

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    memory_bytes: usize,
}

impl CacheState {
    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.memory_bytes = self.memory_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.memory_bytes += entry.size_bytes;
        self.entries.insert(entry.key.clone(), entry);
    }

    fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        self.memory_bytes = 0;
        n
    }

    /// Removes every entry matching `pred`; returns removed entries' associations.
    fn remove_where(&mut self, pred: impl Fn(&CacheEntry) -> bool) -> Vec<String> {
        let doomed: Vec<CacheKey> = self
            .entries
            .values()
            .filter(|e| pred(e))
            .map(|e| e.key.clone())
            .collect();
        doomed
            .iter()
            .filter_map(|k| self.remove(k))
            .map(|e| e.association)
            .collect()
    }
}

/// Marker for an in-flight fetch.
#[derive(Debug, Default)]
struct Pending {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Pending {
    /// Blocks until the fetch finishes or `deadline` passes. Returns false
    /// on timeout.
    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(deadline) = deadline else {
            while !*done {
                done = self.cv.wait(done).unwrap_or_else(PoisonError::into_inner);
            }
            return true;
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let (done, _) = self
            .cv
            .wait_timeout_while(done, remaining, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *done
    }

    fn finish(&self) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_all();
    }
}

/// Clears the pending marker when the leader finishes, even on panic.
struct PendingGuard<'a> {
    inner: &'a CacheInner,
    key: CacheKey,
    pending: Arc<Pending>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        self.pending.finish();
    }
}

struct CacheInner {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<CacheState>,
    pending: Mutex<HashMap<CacheKey, Arc<Pending>>>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ChangeListener>)>>,
    counters: Counters,
    access_seq: AtomicU64,
}

impl CacheInner {
    fn next_seq(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Write access. A poisoned lock may hide a half-applied update, so the
    /// state is dropped wholesale and the lock reset.
    fn write_state(&self) -> RwLockWriteGuard<'_, CacheState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                let mut guard = poisoned.into_inner();
                let dropped = guard.clear();
                self.state.clear_poison();
                warn!(dropped, "cache lock poisoned; dropped all entries");
                guard
            }
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        if let Ok(guard) = self.state.read() {
            return guard;
        }
        drop(self.write_state());
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, key: &CacheKey, count_miss: bool) -> Option<Vec<Record>> {
        let now = self.clock.now();
        let expired = {
            let state = self.read_state();
            match state.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.touch(now, self.next_seq());
                    Counters::bump(&self.counters.hits, 1);
                    debug!(key = %key, rows = entry.rows.len(), "cache hit");
                    return Some(entry.rows.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut state = self.write_state();
            // Re-check: another thread may have refreshed it meanwhile.
            if state.entries.get(key).is_some_and(|e| e.is_expired(now)) {
                state.remove(key);
                Counters::bump(&self.counters.expirations, 1);
            }
        }
        if count_miss {
            Counters::bump(&self.counters.misses, 1);
            debug!(key = %key, expired, "cache miss");
        }
        None
    }

    fn store(
        &self,
        key: CacheKey,
        request: &QueryRequest,
        rows: Vec<Record>,
        duration_hint: Duration,
        ttl_override: Option<Duration>,
    ) -> bool {
        let size_bytes = match serde_json::to_vec(&rows) {
            Ok(encoded) => encoded.len() + key.len(),
            Err(e) => {
                warn!(key = %key, error = %e, "cannot size cache entry; not cached");
                self.reject(&key);
                return false;
            }
        };
        if size_bytes > self.config.max_memory_bytes {
            warn!(
                key = %key,
                size_bytes,
                max_memory_bytes = self.config.max_memory_bytes,
                "result too large to cache"
            );
            self.reject(&key);
            return false;
        }

        let now = self.clock.now();
        let ttl = self.config.ttl_for(request.association(), ttl_override);
        let expires_at = now.checked_add_signed(to_chrono(ttl)).unwrap_or(now);
        let entry = CacheEntry::new(
            key.clone(),
            request,
            rows,
            now,
            expires_at,
            duration_hint,
            size_bytes,
            self.next_seq(),
        );

        let max_entries = self.config.max_entries.max(1);
        let batch = self.config.eviction_batch();
        let mut state = self.write_state();
        state.remove(&key);

        let mut evicted = 0usize;
        while !state.entries.is_empty()
            && (state.entries.len() >= max_entries
                || state.memory_bytes + size_bytes > self.config.max_memory_bytes)
        {
            let mut by_age: Vec<(u64, CacheKey)> = state
                .entries
                .values()
                .map(|e| (e.last_access_seq(), e.key.clone()))
                .collect();
            by_age.sort_unstable();
            for (_, victim) in by_age.into_iter().take(batch) {
                if state.remove(&victim).is_some() {
                    evicted += 1;
                }
            }
        }
        state.insert(entry);
        drop(state);

        Counters::bump(&self.counters.inserts, 1);
        if evicted > 0 {
            Counters::bump(&self.counters.evictions, evicted);
            debug!(evicted, "evicted least recently used entries");
        }
        debug!(key = %key, size_bytes, ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX), "cache insert");
        true
    }

    fn reject(&self, key: &CacheKey) {
        Counters::bump(&self.counters.rejected, 1);
        self.write_state().remove(key);
    }

    fn invalidate(&self, filter: &InvalidationFilter, reason: InvalidationReason) -> usize {
        if filter.is_empty() {
            return 0;
        }
        let associations = self.write_state().remove_where(|e| filter.matches(e));
        let removed = associations.len();
        if removed > 0 {
            Counters::bump(&self.counters.invalidations, removed);
            debug!(removed, reason = ?reason, "cache entries invalidated");
            self.emit(reason, associations);
        }
        removed
    }

    fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let associations = self.write_state().remove_where(|e| e.is_expired(now));
        let removed = associations.len();
        if removed > 0 {
            Counters::bump(&self.counters.expirations, removed);
            info!(removed, "swept expired cache entries");
            self.emit(InvalidationReason::TtlExpire, associations);
        }
        removed
    }

    fn emit(&self, reason: InvalidationReason, associations: Vec<String>) {
        let removed = associations.len();
        let associations: BTreeSet<String> = associations.into_iter().collect();
        let event = CacheInvalidated {
            reason,
            associations: associations.into_iter().collect(),
            removed,
            at: self.clock.now(),
        };
        let listeners: Vec<Arc<dyn ChangeListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.on_cache_invalidated(&event);
        }
    }
}

impl ChangeListener for CacheInner {
    fn on_registry_changed(&self, event: &RegistryChanged) {
        let filter = InvalidationFilter::new().scoped(&event.association, &event.target_kind);
        self.invalidate(&filter, InvalidationReason::RegistryChange);
    }
}

/// Per-process, best-effort query result cache.
pub struct QueryCache {
    inner: Arc<CacheInner>,
    registration: Option<(Weak<AssociationRegistry>, ListenerId)>,
    sweeper: Option<Periodic>,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.inner.config)
            .field("attached", &self.registration.is_some())
            .field("sweeper", &self.sweeper)
            .finish_non_exhaustive()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(CacheConfig::default(), Arc::new(SystemClock))
    }
}

impl QueryCache {
    /// Creates a standalone cache.
    ///
    /// Starts the background sweeper if `config.sweep_interval` is set. If the
    /// thread cannot be spawned the cache still works; expired entries are
    /// then only dropped on access or by `sweep_expired`.
    #[must_use]
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let inner = Arc::new(CacheInner {
            config,
            clock,
            state: RwLock::new(CacheState::default()),
            pending: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            counters: Counters::default(),
            access_seq: AtomicU64::new(0),
        });

        let sweeper = inner.config.sweep_interval.and_then(|interval| {
            match Periodic::spawn("kyro-assoc-cache-sweep", Arc::downgrade(&inner), interval, |c: &CacheInner| {
                c.sweep_expired();
            }) {
                Ok(worker) => Some(worker),
                Err(e) => {
                    warn!(error = %e, "failed to start cache sweeper");
                    None
                }
            }
        });

        Self {
            inner,
            registration: None,
            sweeper,
        }
    }

    /// Creates a cache that invalidates itself on `registry` changes and
    /// shares the registry's clock.
    #[must_use]
    pub fn attach(config: CacheConfig, registry: &Arc<AssociationRegistry>) -> Self {
        let mut cache = Self::new(config, Arc::clone(registry.clock()));
        let listener: Arc<dyn ChangeListener> = cache.inner.clone();
        let id = registry.subscribe(listener);
        cache.registration = Some((Arc::downgrade(registry), id));
        cache
    }

    /// The cache configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Cached rows for `request`, if present and unexpired.
    #[must_use]
    pub fn get(&self, request: &QueryRequest) -> Option<Vec<Record>> {
        let key = cache_key(request)?;
        self.inner.lookup(&key, true)
    }

    /// Stores rows for `request`, evicting least recently used entries first
    /// if the cache is full.
    ///
    /// TTL resolution: `ttl_override`, then the association's TTL, then the
    /// default. Returns false if the rows were not cached (too large, or the
    /// request could not be keyed).
    pub fn set(
        &self,
        request: &QueryRequest,
        rows: Vec<Record>,
        duration_hint: Duration,
        ttl_override: Option<Duration>,
    ) -> bool {
        match cache_key(request) {
            Some(key) => self.inner.store(key, request, rows, duration_hint, ttl_override),
            None => false,
        }
    }

    /// Get-or-populate.
    ///
    /// On a miss the query runs once, even under concurrent callers: later
    /// callers wait for the in-flight fetch. Failed or timed-out fetches are
    /// not cached; waiting callers then retry the miss path themselves.
    /// A waiting caller gives up once its own timeout has elapsed.
    ///
    /// # Errors
    ///
    /// Whatever `Query::execute` returns on a miss, or `Timeout` if the
    /// request's timeout runs out while waiting on another caller's fetch.
    pub fn execute(&self, query: &Query) -> AssocResult<Vec<Record>> {
        let request = query.request();
        let Some(key) = cache_key(request) else {
            return query.execute();
        };
        let deadline = request.timeout().and_then(|t| Instant::now().checked_add(t));
        let timed_out = || -> AssocError {
            let duration_ms = request
                .timeout()
                .map_or(u64::MAX, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
            debug!(association = %request.association(), duration_ms, "gave up waiting on in-flight fetch");
            ExecutionError::Timeout { duration_ms }.into()
        };

        let mut count_miss = true;
        loop {
            if let Some(rows) = self.inner.lookup(&key, count_miss) {
                return Ok(rows);
            }
            count_miss = false;

            let (pending, leader) = {
                let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
                match pending.get(&key) {
                    Some(p) => (Arc::clone(p), false),
                    None => {
                        let p = Arc::new(Pending::default());
                        pending.insert(key.clone(), Arc::clone(&p));
                        (p, true)
                    }
                }
            };
            if !leader {
                if !pending.wait_until(deadline) {
                    return Err(timed_out());
                }
                continue;
            }

            let _guard = PendingGuard {
                inner: &self.inner,
                key: key.clone(),
                pending,
            };
            // Budget spent waiting on a leader that failed.
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(timed_out());
            }
            // The previous leader may have finished between our lookup and
            // taking over.
            if let Some(rows) = self.inner.lookup(&key, false) {
                return Ok(rows);
            }
            let started = Instant::now();
            let result = query.execute();
            if let Ok(rows) = &result {
                self.inner.store(key, request, rows.clone(), started.elapsed(), None);
            }
            return result;
        }
    }

    /// Removes matching entries and returns how many were removed.
    pub fn invalidate(&self, filter: &InvalidationFilter) -> usize {
        self.inner.invalidate(filter, InvalidationReason::Manual)
    }

    /// Removes every expired entry now.
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep_expired()
    }

    /// Drops every entry without emitting an event.
    pub fn clear(&self) -> usize {
        self.inner.write_state().clear()
    }

    /// Registers a listener for `CacheInvalidated` events.
    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        let id = ListenerId::new();
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let state = self.inner.read_state();
        self.inner.counters.snapshot(state.entries.len(), state.memory_bytes)
    }

    /// Number of entries, expired ones included until swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read_state().entries.len()
    }

    /// True if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Metadata of the entry cached for `request`, expired or not.
    #[must_use]
    pub fn entry_info(&self, request: &QueryRequest) -> Option<EntryInfo> {
        let key = cache_key(request)?;
        self.inner.read_state().entries.get(&key).map(CacheEntry::info)
    }

    /// Metadata of all entries, most recently used first.
    #[must_use]
    pub fn entries(&self) -> Vec<EntryInfo> {
        let state = self.inner.read_state();
        let mut entries: Vec<&CacheEntry> = state.entries.values().collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.last_access_seq()));
        entries.into_iter().map(CacheEntry::info).collect()
    }
}

impl Drop for QueryCache {
    fn drop(&mut self) {
        if let Some((registry, id)) = self.registration.take() {
            if let Some(registry) = registry.upgrade() {
                registry.unsubscribe(id);
            }
        }
        if let Some(mut sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
    }
}

fn cache_key(request: &QueryRequest) -> Option<CacheKey> {
    match CacheKey::for_request(request) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(association = %request.association(), error = %e, "request cannot be keyed; bypassing cache");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;
    use crate::association::{AssociationSpec, Provenance};
    use crate::events::ChannelListener;
    use crate::query::QueryBuilder;
    use crate::storage::InMemoryDataSource;
    use crate::time::ManualClock;
    use crate::value::Value;

    struct Fixture {
        clock: Arc<ManualClock>,
        registry: Arc<AssociationRegistry>,
        source: Arc<InMemoryDataSource>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::default());
            let registry = Arc::new(AssociationRegistry::with_clock(clock.clone()));
            for assoc in ["loggable", "commentable"] {
                registry
                    .register_association(AssociationSpec::new(assoc).table(format!("{assoc}_rows")))
                    .unwrap();
            }
            registry.add_target("loggable", "jobs", "Job", Provenance::Manual).unwrap();
            registry.add_target("loggable", "tasks", "Task", Provenance::Manual).unwrap();
            registry.add_target("commentable", "posts", "Post", Provenance::Manual).unwrap();

            let source = Arc::new(InMemoryDataSource::new());
            for (id, kind) in [(1, "jobs"), (2, "tasks")] {
                source
                    .insert("loggable_rows", Record::new().with("id", id).with("loggable_type", kind))
                    .unwrap();
            }
            source
                .insert("commentable_rows", Record::new().with("id", 9).with("commentable_type", "posts"))
                .unwrap();
            Self { clock, registry, source }
        }

        fn query(&self, association: &str) -> QueryBuilder {
            QueryBuilder::new(Arc::clone(&self.registry), self.source.clone(), association)
        }

        fn cache(&self, config: CacheConfig) -> QueryCache {
            QueryCache::attach(config.with_sweep_interval(None), &self.registry)
        }
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        let query = fx.query("loggable").build().unwrap();
        let rows = vec![Record::new().with("id", 1).with("note", Value::Null)];

        assert!(cache.get(query.request()).is_none());
        assert!(cache.set(query.request(), rows.clone(), Duration::from_millis(3), None));
        assert_eq!(cache.get(query.request()), Some(rows));

        let m = cache.metrics();
        assert_eq!((m.hits, m.misses, m.entries), (1, 1, 1));
    }

    #[test]
    fn test_ttl_expiry_with_manual_clock() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        let query = fx.query("loggable").build().unwrap();
        cache.set(query.request(), vec![], Duration::ZERO, Some(Duration::from_millis(1)));

        assert!(cache.get(query.request()).is_some());
        fx.clock.advance(chrono::Duration::milliseconds(2));
        assert!(cache.get(query.request()).is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.metrics().expirations, 1);
    }

    #[test]
    fn test_association_ttl_applies() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default().with_association_ttl("loggable", Duration::from_secs(1)));
        let logs = fx.query("loggable").build().unwrap();
        let comments = fx.query("commentable").build().unwrap();
        cache.set(logs.request(), vec![], Duration::ZERO, None);
        cache.set(comments.request(), vec![], Duration::ZERO, None);

        fx.clock.advance(chrono::Duration::seconds(2));
        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.get(comments.request()).is_some());
    }

    #[test]
    fn test_execute_hits_after_first_run() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        let query = fx.query("loggable").target("jobs").build().unwrap();

        let first = cache.execute(&query).unwrap();
        let second = cache.execute(&query).unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.source.query_count(), 1);
        assert_eq!(cache.metrics().hits, 1);
        assert_eq!(cache.metrics().misses, 1);
    }

    #[test]
    fn test_failed_execution_is_not_cached() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        fx.source.set_latency(Some(Duration::from_millis(100))).unwrap();
        let query = fx.query("loggable").timeout(Duration::from_millis(5)).build().unwrap();

        assert!(cache.execute(&query).unwrap_err().is_timeout());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_single_flight() {
        let fx = Fixture::new();
        let cache = Arc::new(fx.cache(CacheConfig::default()));
        fx.source.set_latency(Some(Duration::from_millis(50))).unwrap();
        let query = fx.query("loggable").build().unwrap();

        let ok = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    if cache.execute(&query).is_ok() {
                        ok.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(ok.load(Ordering::Relaxed), 8);
        assert_eq!(fx.source.query_count(), 1);
    }

    #[test]
    fn test_invalidate_association_is_scoped() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        let logs = fx.query("loggable").build().unwrap();
        let comments = fx.query("commentable").build().unwrap();
        cache.set(logs.request(), vec![], Duration::ZERO, None);
        cache.set(comments.request(), vec![], Duration::ZERO, None);

        assert_eq!(cache.invalidate(&InvalidationFilter::new().association("loggable")), 1);
        assert!(cache.get(logs.request()).is_none());
        assert!(cache.get(comments.request()).is_some());
    }

    #[test]
    fn test_registry_change_invalidates_matching_target() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        let (listener, rx) = ChannelListener::new(8);
        cache.subscribe(Arc::new(listener));

        let jobs = fx.query("loggable").target("jobs").build().unwrap();
        let tasks = fx.query("loggable").target("tasks").build().unwrap();
        let all_logs = fx.query("loggable").build().unwrap();
        for q in [&jobs, &tasks, &all_logs] {
            cache.execute(q).unwrap();
        }
        assert_eq!(cache.len(), 3);

        fx.registry.deactivate_target("loggable", "jobs").unwrap();
        // jobs-only and follow-the-registry entries go; tasks-only stays.
        assert_eq!(cache.len(), 1);
        assert!(cache.get(tasks.request()).is_some());

        match rx.try_recv().unwrap() {
            crate::events::ChangeEvent::Cache(event) => {
                assert_eq!(event.reason, InvalidationReason::RegistryChange);
                assert_eq!(event.removed, 2);
                assert_eq!(event.associations, vec!["loggable".to_string()]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default().with_max_entries(3));
        let queries: Vec<Query> = (0..4)
            .map(|i| fx.query("loggable").limit(i + 1).build().unwrap())
            .collect();

        for q in &queries[..3] {
            cache.set(q.request(), vec![], Duration::ZERO, None);
        }
        // Touch the oldest so the second becomes least recently used.
        assert!(cache.get(queries[0].request()).is_some());
        cache.set(queries[3].request(), vec![], Duration::ZERO, None);

        assert_eq!(cache.len(), 3);
        assert!(cache.entry_info(queries[1].request()).is_none());
        assert!(cache.entry_info(queries[0].request()).is_some());
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[test]
    fn test_oversized_result_is_rejected() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default().with_max_memory_bytes(64));
        let query = fx.query("loggable").build().unwrap();
        let rows = vec![Record::new().with("blob", "x".repeat(256))];

        assert!(!cache.set(query.request(), rows, Duration::ZERO, None));
        assert!(cache.is_empty());
        assert_eq!(cache.metrics().rejected, 1);
    }

    #[test]
    fn test_drop_unsubscribes_from_registry() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        drop(cache);
        // No listener left to call; the mutation must still succeed.
        fx.registry.add_target("loggable", "runs", "Run", Provenance::Runtime).unwrap();
        assert_eq!(Arc::strong_count(&fx.registry), 1);
    }

    #[test]
    fn test_background_sweeper_runs() {
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(AssociationRegistry::with_clock(clock.clone()));
        registry.add_target("loggable", "jobs", "Job", Provenance::Manual).unwrap();
        let source = Arc::new(InMemoryDataSource::new());
        let cache = QueryCache::attach(
            CacheConfig::default().with_sweep_interval(Some(Duration::from_millis(5))),
            &registry,
        );
        let query = QueryBuilder::new(Arc::clone(&registry), source, "loggable").build().unwrap();
        cache.set(query.request(), vec![], Duration::ZERO, Some(Duration::from_secs(1)));

        clock.advance(chrono::Duration::seconds(5));
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cache.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(cache.is_empty());
    }
    #[test]
    fn test_waiter_gives_up_at_its_own_timeout() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        fx.source.set_latency(Some(Duration::from_millis(400))).unwrap();
        let slow = fx.query("loggable").build().unwrap();
        let fast = fx.query("loggable").timeout(Duration::from_millis(20)).build().unwrap();

        thread::scope(|s| {
            let leader = s.spawn(|| cache.execute(&slow));
            thread::sleep(Duration::from_millis(30));

            let started = Instant::now();
            let err = cache.execute(&fast).unwrap_err();
            assert!(err.is_timeout());
            assert!(started.elapsed() < Duration::from_millis(200), "waited {:?}", started.elapsed());

            assert!(leader.join().unwrap().is_ok());
        });
        // Only the leader's result was stored.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.metrics().inserts, 1);
    }

    #[test]
    fn test_sweep_emits_ttl_expire_event() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        let (listener, rx) = ChannelListener::new(8);
        cache.subscribe(Arc::new(listener));

        let logs = fx.query("loggable").build().unwrap();
        let comments = fx.query("commentable").build().unwrap();
        cache.set(logs.request(), vec![], Duration::ZERO, Some(Duration::from_secs(1)));
        cache.set(comments.request(), vec![], Duration::ZERO, Some(Duration::from_secs(60)));

        fx.clock.advance(chrono::Duration::seconds(2));
        assert_eq!(cache.sweep_expired(), 1);

        match rx.try_recv().unwrap() {
            crate::events::ChangeEvent::Cache(event) => {
                assert_eq!(event.reason, InvalidationReason::TtlExpire);
                assert_eq!(event.removed, 1);
                assert_eq!(event.associations, vec!["loggable".to_string()]);
                assert_eq!(event.at, fx.clock.now());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // Nothing left to sweep: no second event.
        assert_eq!(cache.sweep_expired(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_entry_tracks_hits_and_last_access() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        let query = fx.query("loggable").build().unwrap();
        let inserted_at = fx.clock.now();
        cache.set(query.request(), vec![Record::new().with("id", 1)], Duration::from_millis(7), None);

        let info = cache.entry_info(query.request()).unwrap();
        assert_eq!(info.hits, 0);
        assert_eq!(info.last_accessed, inserted_at);

        fx.clock.advance(chrono::Duration::seconds(3));
        assert!(cache.get(query.request()).is_some());
        fx.clock.advance(chrono::Duration::seconds(4));
        assert!(cache.get(query.request()).is_some());

        let info = cache.entry_info(query.request()).unwrap();
        assert_eq!(info.hits, 2);
        assert_eq!(info.created_at, inserted_at);
        assert_eq!(info.last_accessed, inserted_at + chrono::Duration::seconds(7));
        assert_eq!(info.rows, 1);
        assert_eq!(info.fetch_duration, Duration::from_millis(7));
    }
}
