//! Collaborator traits.
//!
//! The core never talks to a concrete database or file format. It consumes:
//! - a `DataSource` that runs flat query plans and answers schema/statistics
//!   questions for discovery;
//! - a `ConfigStore` that loads and saves the registry configuration.

use thiserror::Error;

use crate::association::RegistryConfiguration;
use crate::query::QueryPlan;
use crate::value::{Record, Value};

/// Errors raised by a data-access collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Table does not exist.
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Field does not exist on the table.
    #[error("Field not found: {table}.{field}")]
    FieldNotFound {
        /// Table name.
        table: String,
        /// Field name.
        field: String,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Errors raised by the configuration persistence collaborator.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Underlying I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored configuration uses a format this build does not understand.
    #[error("Unsupported configuration version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found in storage.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },

    /// Backend-specific failure.
    #[error("Persistence backend error: {0}")]
    Backend(String),
}

/// Data-access collaborator.
///
/// # Safety Considerations
/// - Implementations are shared across threads (batch queries fan out)
/// - `run_query` may block on I/O; callers apply their own timeouts
pub trait DataSource: Send + Sync {
    /// Runs a flat plan and returns matching rows.
    fn run_query(&self, plan: &QueryPlan) -> Result<Vec<Record>, StorageError>;

    /// Distinct non-null values of `table.field` with their record counts.
    fn list_distinct_values(&self, table: &str, field: &str) -> Result<Vec<(Value, u64)>, StorageError>;

    /// All known tables.
    fn list_tables(&self) -> Result<Vec<String>, StorageError>;

    /// All fields of `table`.
    fn list_fields(&self, table: &str) -> Result<Vec<String>, StorageError>;
}

/// Configuration persistence collaborator.
pub trait ConfigStore: Send + Sync {
    /// Loads the stored configuration. `Ok(None)` means nothing was stored yet.
    fn load(&self) -> Result<Option<RegistryConfiguration>, PersistenceError>;

    /// Replaces the stored configuration.
    fn save(&self, config: &RegistryConfiguration) -> Result<(), PersistenceError>;
}
