//! In-memory collaborators.
//!
//! Thread-safe reference implementations of `DataSource` and `ConfigStore`.
//! They are intended for embedded usage and tests; the data source also
//! counts calls and can simulate latency and scan failures.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use crate::association::RegistryConfiguration;
use crate::query::{QueryPlan, SortDirection};
use crate::storage::traits::{ConfigStore, DataSource, PersistenceError, StorageError};
use crate::value::{Record, Value};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct Table {
    fields: BTreeSet<String>,
    rows: Vec<Record>,
}

#[derive(Debug, Default)]
struct SourceState {
    tables: BTreeMap<String, Table>,
    failing_scans: HashSet<(String, String)>,
    latency: Option<Duration>,
}

/// Thread-safe in-memory data source.
#[derive(Debug, Default)]
pub struct InMemoryDataSource {
    state: RwLock<SourceState>,
    queries: AtomicU64,
    scans: AtomicU64,
}

impl InMemoryDataSource {
    /// Create a new empty data source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a table with a known field list (rows may add more fields).
    pub fn create_table<I, S>(&self, table: &str, fields: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.write().map_err(|_| lock_err("source.create_table"))?;
        let entry = state.tables.entry(table.to_string()).or_default();
        entry.fields.extend(fields.into_iter().map(Into::into));
        Ok(())
    }

    /// Appends a row, creating the table if needed.
    pub fn insert(&self, table: &str, record: Record) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("source.insert"))?;
        let entry = state.tables.entry(table.to_string()).or_default();
        entry.fields.extend(record.field_names().map(str::to_string));
        entry.rows.push(record);
        Ok(())
    }

    /// Appends many rows.
    pub fn insert_all(&self, table: &str, records: impl IntoIterator<Item = Record>) -> Result<(), StorageError> {
        for record in records {
            self.insert(table, record)?;
        }
        Ok(())
    }

    /// Makes every `run_query` sleep for `latency` first.
    pub fn set_latency(&self, latency: Option<Duration>) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("source.set_latency"))?;
        state.latency = latency;
        Ok(())
    }

    /// Makes `list_distinct_values(table, field)` fail.
    pub fn fail_scans_for(&self, table: &str, field: &str) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("source.fail_scans_for"))?;
        state.failing_scans.insert((table.to_string(), field.to_string()));
        Ok(())
    }

    /// Number of `run_query` calls so far.
    #[must_use]
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Number of `list_distinct_values` calls so far.
    #[must_use]
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }
}

impl DataSource for InMemoryDataSource {
    fn run_query(&self, plan: &QueryPlan) -> Result<Vec<Record>, StorageError> {
        self.queries.fetch_add(1, Ordering::Relaxed);

        let latency = self.state.read().map_err(|_| lock_err("source.run_query"))?.latency;
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }

        let state = self.state.read().map_err(|_| lock_err("source.run_query"))?;
        let table = state
            .tables
            .get(&plan.table)
            .ok_or_else(|| StorageError::TableNotFound(plan.table.clone()))?;

        let mut rows: Vec<Record> = table
            .rows
            .iter()
            .filter(|row| plan.conditions.iter().all(|(field, cond)| cond.matches(row.get(field))))
            .cloned()
            .collect();

        if !plan.order_by.is_empty() {
            rows.sort_by(|a, b| {
                for order in &plan.order_by {
                    let left = a.get(&order.field).unwrap_or(&Value::Null);
                    let right = b.get(&order.field).unwrap_or(&Value::Null);
                    let ord = match order.direction {
                        SortDirection::Asc => left.compare(right),
                        SortDirection::Desc => right.compare(left),
                    };
                    if ord.is_ne() {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        let rows = rows.into_iter().skip(plan.offset);
        Ok(match plan.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }

    fn list_distinct_values(&self, table: &str, field: &str) -> Result<Vec<(Value, u64)>, StorageError> {
        self.scans.fetch_add(1, Ordering::Relaxed);

        let state = self.state.read().map_err(|_| lock_err("source.list_distinct_values"))?;
        if state.failing_scans.contains(&(table.to_string(), field.to_string())) {
            return Err(StorageError::BackendError(format!("scan of {table}.{field} failed")));
        }
        let data = state
            .tables
            .get(table)
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;
        if !data.fields.contains(field) {
            return Err(StorageError::FieldNotFound {
                table: table.to_string(),
                field: field.to_string(),
            });
        }

        let mut counts: HashMap<String, (Value, u64)> = HashMap::new();
        for value in data.rows.iter().filter_map(|r| r.get(field)).filter(|v| !v.is_null()) {
            let key = serde_json::to_string(value).map_err(|e| StorageError::SerializationError(e.to_string()))?;
            counts.entry(key).or_insert_with(|| (value.clone(), 0)).1 += 1;
        }

        let mut out: Vec<(Value, u64)> = counts.into_values().collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.compare(&b.0)));
        Ok(out)
    }

    fn list_tables(&self) -> Result<Vec<String>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("source.list_tables"))?;
        Ok(state.tables.keys().cloned().collect())
    }

    fn list_fields(&self, table: &str) -> Result<Vec<String>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("source.list_fields"))?;
        state
            .tables
            .get(table)
            .map(|t| t.fields.iter().cloned().collect())
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))
    }
}

/// Thread-safe in-memory configuration store.
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    config: RwLock<Option<RegistryConfiguration>>,
    saves: AtomicU64,
    fail_saves: AtomicBool,
}

impl InMemoryConfigStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `config`.
    #[must_use]
    pub fn with_config(config: RegistryConfiguration) -> Self {
        Self {
            config: RwLock::new(Some(config)),
            ..Self::default()
        }
    }

    /// Number of successful saves.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Makes subsequent saves fail.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Relaxed);
    }

    /// Last saved configuration.
    #[must_use]
    pub fn stored(&self) -> Option<RegistryConfiguration> {
        self.config.read().ok().and_then(|c| c.clone())
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn load(&self) -> Result<Option<RegistryConfiguration>, PersistenceError> {
        let config = self
            .config
            .read()
            .map_err(|_| PersistenceError::Backend("poisoned lock: config.load".to_string()))?;
        Ok(config.clone())
    }

    fn save(&self, config: &RegistryConfiguration) -> Result<(), PersistenceError> {
        if self.fail_saves.load(Ordering::Relaxed) {
            return Err(PersistenceError::Backend("save rejected".to_string()));
        }
        let mut stored = self
            .config
            .write()
            .map_err(|_| PersistenceError::Backend("poisoned lock: config.save".to_string()))?;
        *stored = Some(config.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
